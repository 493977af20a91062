//! `threadsync`: conversation sync engine with optimistic mutations and
//! bidirectional pagination over a reactive remote data source.

pub mod config;
pub mod display;
pub mod remote;
pub mod sync;
