//! Integration test helpers for edgehive end-to-end scenarios: a mock cloud
//! tunnel server, a fake upstream video source and bus modules that answer
//! or ignore requests.

pub mod harness;
