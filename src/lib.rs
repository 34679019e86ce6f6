#![cfg_attr(doc, doc = include_str!("../README.md"))]

pub mod aggregator;
pub mod error;
pub mod state;
pub mod ws;

use crate::error::Error;

pub type Result<T> = std::result::Result<T, Error>;

pub use aggregator::ConnectionAggregator;
pub use state::{ConnectionState, ListenerId, StateListener};
pub use ws::{Command, Connection, ConnectionClient, Handler};
