//! Domain types shared by the job manager, the workers and the CLI.

pub mod jobs;
