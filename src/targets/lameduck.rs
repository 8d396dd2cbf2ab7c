//! Lame-duck endpoint listing.
//!
//! Initialization and lister retrieval are separate steps: a broken source
//! (unreadable file) fails initialization, while a service with nothing to
//! list only fails [`LameDuckService::lister`], which callers treat as a
//! degraded mode.

use crate::config::LameDuckOptions;
use crate::{CadenceError, Result};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Source of endpoint names currently excluded from probing.
pub trait Lister: Send + Sync + fmt::Debug {
    fn list(&self) -> Vec<String>;

    fn is_lame_duck(&self, name: &str) -> bool {
        self.list().iter().any(|n| n == name)
    }
}

/// Fixed set of lame-duck names.
#[derive(Debug, Default)]
pub struct StaticLister {
    names: HashSet<String>,
}

impl StaticLister {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }
}

impl Lister for StaticLister {
    fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.names.iter().cloned().collect();
        names.sort();
        names
    }

    fn is_lame_duck(&self, name: &str) -> bool {
        self.names.contains(name)
    }
}

pub struct LameDuckService {
    lister: Option<Arc<StaticLister>>,
}

impl LameDuckService {
    pub fn init(opts: &LameDuckOptions) -> Result<Self> {
        let mut names = opts.names.clone();
        if let Some(path) = &opts.file {
            let text = std::fs::read_to_string(path).map_err(|e| {
                CadenceError::init(
                    "lame-duck",
                    format!("failed to read {}: {}", path.display(), e),
                )
            })?;
            let from_file = parse_names(&text);
            debug!(path = %path.display(), count = from_file.len(), "Loaded lame-duck names");
            names.extend(from_file);
        }

        let configured = !opts.names.is_empty() || opts.file.is_some();
        let lister = configured.then(|| Arc::new(StaticLister::new(names)));
        if let Some(lister) = &lister {
            info!(count = lister.names.len(), "Lame-duck lister initialized");
        }
        Ok(Self { lister })
    }

    pub fn lister(&self) -> Result<Arc<dyn Lister>> {
        match &self.lister {
            Some(lister) => Ok(Arc::clone(lister) as Arc<dyn Lister>),
            None => Err(CadenceError::FailedPrecondition(
                "no lame-duck source configured".to_string(),
            )),
        }
    }
}

fn parse_names(text: &str) -> Vec<String> {
    text.lines()
        .map(|line| line.split('#').next().unwrap_or("").trim())
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}
