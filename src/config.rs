//! Run configuration: dimension, level bounds, topology sizing, and the
//! nonblocking-collective switch.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::level::{BoundaryFlags, DimType, LevelVector};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub dim: DimType,
    pub lmin: Vec<i64>,
    pub lmax: Vec<i64>,
    pub boundary: Vec<bool>,
    /// Number of process groups.
    pub num_groups: usize,
    /// Worker processes per group.
    pub group_size: usize,
    /// Node-local team size within a group. 1 disables teaming.
    #[serde(default = "default_team_size")]
    pub team_size: usize,
    /// Time-integration steps a task advances per `RUN_FIRST`/`RUN_NEXT`.
    pub steps_per_combine: usize,
    /// Number of combine rounds in the run.
    pub num_combinations: usize,
    /// Use one `Iallreduce` per owned subspace with a final `Waitall`
    /// instead of a single blocking allreduce over the flat buffer.
    #[serde(default)]
    pub nonblocking: bool,
}

fn default_team_size() -> usize {
    1
}

impl RunConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let mut cfg: RunConfig =
            toml::from_str(s).map_err(|e| Error::Config(e.to_string()))?;
        if std::env::var("USE_NONBLOCKING_MPI_COLLECTIVE").is_ok() {
            cfg.nonblocking = true;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;
        let mut cfg: RunConfig = settings
            .try_deserialize()
            .map_err(|e| Error::Config(e.to_string()))?;
        if std::env::var("USE_NONBLOCKING_MPI_COLLECTIVE").is_ok() {
            cfg.nonblocking = true;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.lmin.len() != self.dim || self.lmax.len() != self.dim || self.boundary.len() != self.dim {
            return Err(Error::Config(format!(
                "lmin/lmax/boundary must have length dim={}",
                self.dim
            )));
        }
        if self.num_groups == 0 || self.group_size == 0 {
            return Err(Error::Config("num_groups and group_size must be > 0".into()));
        }
        if !self.group_size.is_multiple_of(self.team_size) {
            return Err(Error::Config("team_size must divide group_size".into()));
        }
        Ok(())
    }

    pub fn lmin_vector(&self) -> LevelVector {
        LevelVector::new(self.lmin.clone())
    }

    pub fn lmax_vector(&self) -> LevelVector {
        LevelVector::new(self.lmax.clone())
    }

    pub fn boundary_flags(&self) -> BoundaryFlags {
        BoundaryFlags::new(self.boundary.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_toml() {
        let toml = r#"
            dim = 2
            lmin = [1, 1]
            lmax = [3, 3]
            boundary = [true, true]
            num_groups = 4
            group_size = 4
            steps_per_combine = 10
            num_combinations = 5
        "#;
        let cfg = RunConfig::from_toml_str(toml).unwrap();
        assert_eq!(cfg.dim, 2);
        assert_eq!(cfg.team_size, 1);
        assert!(!cfg.nonblocking);
    }

    #[test]
    fn rejects_mismatched_dim() {
        let toml = r#"
            dim = 2
            lmin = [1]
            lmax = [3, 3]
            boundary = [true, true]
            num_groups = 1
            group_size = 1
            steps_per_combine = 1
            num_combinations = 1
        "#;
        assert!(RunConfig::from_toml_str(toml).is_err());
    }
}
