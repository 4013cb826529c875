// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Forwards local TCP connections over a single multiplexed QUIC connection
//!
//! The client side accepts TCP sockets and maps each one onto a fresh stream of
//! one long-lived transport connection; the server side accepts those streams
//! and dials a fixed backend for each of them.
#![warn(unused_imports)]

pub mod common;
pub mod util;

pub mod client;
pub mod server;
