#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub use ec_sync as sync;
pub use ec_threadpool as threadpool;
