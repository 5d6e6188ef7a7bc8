use std::{collections::HashMap, path::Path};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::{common::JobDefinition, manifest::slug};

/// The predefined jobs an operator may launch.
#[derive(Serialize, Deserialize, Debug, Default, Eq, PartialEq, Clone)]
pub struct Catalog {
    #[serde(default)]
    pub jobs: Vec<JobDefinition>,
}

impl Catalog {
    /// read the catalog from a yaml file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let catalog_file = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read job catalog at {}", path.to_string_lossy()))?;
        Self::from_yaml(&catalog_file)
            .with_context(|| format!("invalid job catalog at {}", path.to_string_lossy()))
    }

    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let catalog: Catalog = serde_yaml::from_str(yaml)?;
        catalog.check()?;
        Ok(catalog)
    }

    /// Every entry must be valid on its own, and no two entries may map to the same Job name.
    fn check(&self) -> anyhow::Result<()> {
        let mut seen: HashMap<String, &str> = HashMap::new();
        for (index, job) in self.jobs.iter().enumerate() {
            job.validate()
                .with_context(|| format!("catalog entry {index} ({:?})", job.name))?;
            if let Some(ns) = &job.namespace {
                ns.parse::<crate::config::Namespace>()
                    .with_context(|| format!("catalog entry {:?}", job.name))?;
            }
            if let Some(previous) = seen.insert(slug(&job.name), &job.name) {
                anyhow::bail!(
                    "catalog entries {:?} and {:?} both map to job name {:?}; rename one of them",
                    previous,
                    job.name,
                    slug(&job.name)
                );
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&JobDefinition> {
        self.jobs.iter().find(|job| job.name == name)
    }

    /// Looks an entry up by the cluster name its jobs are created under.
    pub fn by_job_name(&self, job_name: &str) -> Option<&JobDefinition> {
        self.jobs.iter().find(|job| slug(&job.name) == job_name)
    }
}
