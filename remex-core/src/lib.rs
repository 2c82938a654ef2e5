//! Remex Core
//!
//! Core types shared by the remote execution orchestrator and its clients.
//!
//! This crate contains:
//! - Domain types: executors, runs, pools, tasks and per-type global state
//! - DTOs: bodies exchanged with remote agents and remote executors

pub mod domain;
pub mod dto;
