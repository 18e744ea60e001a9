//! Subdispatch - Multi-GPU Batch Transcription
//!
//! Dispatches a folder of videos across the GPUs of one machine, running an
//! external whisper transcriber per file, and keeps the folder layout
//! recoverable after crashes.

pub mod admission;
pub mod cli;
pub mod command;
pub mod config;
pub mod device;
pub mod error;
pub mod executor;
pub mod job;
pub mod layout;
pub mod postprocess;
pub mod recovery;
pub mod scheduler;
pub mod subtitle;
pub mod transcribe;
pub mod workflow;
