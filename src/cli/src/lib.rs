//! CVM Image CLI - publish confidential VM images to cloud providers.

pub mod commands;
pub mod output;
