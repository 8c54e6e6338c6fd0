//! Skill bundles: fetching them from GitHub, tracking them in a local
//! registry, and linking them into projects.
//!
//! A bundle is a directory inside a GitHub repository that contains a
//! `SKILL.md` file. Installed bundles live under a store directory, one
//! subdirectory per bundle, and are recorded in `skills.json`. Projects use a
//! bundle through a symlink under `.opencode/skills/<name>`.

pub mod client;
pub mod confirm;
pub mod error;
pub mod install;
pub mod link;
pub mod materialize;
pub mod memory;
pub mod migration;
pub mod parse;
mod pool;
pub mod registry;
pub mod remove;
pub mod retry;
pub mod source;
pub mod tidy;
pub mod types;
pub mod updater;

pub use {
    client::{ClientOptions, GithubClient, RemoteTreeClient},
    error::{Error, ErrorKind, Result},
    install::{InstallOutcome, Installer},
    link::{LinkInfo, Linker},
    materialize::Materializer,
    registry::RegistryStore,
    remove::{RemoveOutcome, Remover},
    source::SourceRef,
    tidy::{Tidier, TidyReport},
    types::{BundleRecord, LinkedProject, MaterializeStats},
    updater::{UpdateStats, Updater},
};
