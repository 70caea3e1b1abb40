//! RSS Digest - per-group feed digests on a schedule
//!
//! This crate fetches RSS/Atom feeds for independent groups, deduplicates
//! articles across feeds and runs, scores and summarizes the new ones, and
//! delivers a markdown digest to each group's destinations at the times
//! configured in the owner's timezone.

pub mod canonical;
pub mod config;
pub mod db;
pub mod delivery;
pub mod digest;
pub mod error;
pub mod evaluation;
pub mod fetcher;
pub mod materialize;
pub mod models;
pub mod pipeline;
pub mod runner;
pub mod scheduler;
