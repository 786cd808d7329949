// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static CONFIG: OnceLock<NovaExecConfig> = OnceLock::new();

fn default_log_level() -> String {
    "info".to_string()
}

pub fn init_from_path(path: impl AsRef<Path>) -> Result<&'static NovaExecConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = path.as_ref().to_path_buf();
    let cfg = NovaExecConfig::load_from_file(&path)?;
    let _ = CONFIG.set(cfg);
    CONFIG
        .get()
        .ok_or_else(|| anyhow!("config singleton was not initialized"))
}

pub fn init_from_env_or_default() -> Result<&'static NovaExecConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = config_path_from_env_or_default()?;
    init_from_path(path)
}

pub fn config() -> Result<&'static NovaExecConfig> {
    init_from_env_or_default()
}

fn config_path_from_env_or_default() -> Result<PathBuf> {
    if let Ok(p) = std::env::var("NOVAEXEC_CONFIG") {
        if !p.trim().is_empty() {
            return Ok(PathBuf::from(p));
        }
    }

    let candidates = [PathBuf::from("novaexec.toml")];
    for p in candidates {
        if p.exists() {
            return Ok(p);
        }
    }

    Err(anyhow!(
        "missing config file: set $NOVAEXEC_CONFIG or create ./novaexec.toml"
    ))
}

#[derive(Clone, Debug, Deserialize)]
pub struct NovaExecConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional full tracing EnvFilter expression.
    /// If set, this takes precedence over `log_level`.
    /// Example: "novaexec=debug"
    #[serde(default)]
    pub log_filter: Option<String>,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub query: QueryConfig,

    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl NovaExecConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("read config file: {}", path.display()))?;
        Self::from_toml_str(&s).with_context(|| format!("parse toml: {}", path.display()))
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let cfg: NovaExecConfig = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn effective_log_filter(&self) -> &str {
        self.log_filter.as_deref().unwrap_or(&self.log_level)
    }

    fn validate(&self) -> Result<()> {
        if self.pool.capacity_bytes <= 0 {
            return Err(anyhow!(
                "pool.capacity_bytes must be positive, got {}",
                self.pool.capacity_bytes
            ));
        }
        if self.pool.system_capacity_bytes <= 0 {
            return Err(anyhow!(
                "pool.system_capacity_bytes must be positive, got {}",
                self.pool.system_capacity_bytes
            ));
        }
        if let Some(v) = self.query.max_memory_bytes
            && v <= 0
        {
            return Err(anyhow!("query.max_memory_bytes must be positive, got {v}"));
        }
        if let Some(v) = self.query.max_total_memory_bytes
            && v <= 0
        {
            return Err(anyhow!(
                "query.max_total_memory_bytes must be positive, got {v}"
            ));
        }
        Ok(())
    }
}

impl Default for NovaExecConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_filter: None,
            pool: PoolConfig::default(),
            query: QueryConfig::default(),
            runtime: RuntimeConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct PoolConfig {
    /// Hard ceiling for the aggregate user-memory reservation.
    #[serde(default = "default_pool_capacity_bytes", alias = "capacityBytes")]
    pub capacity_bytes: i64,
    #[serde(
        default = "default_system_pool_capacity_bytes",
        alias = "systemCapacityBytes"
    )]
    pub system_capacity_bytes: i64,
}

fn default_pool_capacity_bytes() -> i64 {
    1 << 30
}

fn default_system_pool_capacity_bytes() -> i64 {
    256 << 20
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: default_pool_capacity_bytes(),
            system_capacity_bytes: default_system_pool_capacity_bytes(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct QueryConfig {
    #[serde(default, alias = "maxMemoryBytes")]
    pub max_memory_bytes: Option<i64>,
    #[serde(default, alias = "maxTotalMemoryBytes")]
    pub max_total_memory_bytes: Option<i64>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_pipeline_exec_thread_pool_thread_num")]
    pub pipeline_exec_thread_pool_thread_num: usize,
    #[serde(default = "default_driver_time_slice_ms")]
    pub driver_time_slice_ms: u64,
}

fn default_pipeline_exec_thread_pool_thread_num() -> usize {
    0
}

fn default_driver_time_slice_ms() -> u64 {
    200
}

impl RuntimeConfig {
    pub fn actual_exec_threads(&self) -> usize {
        if self.pipeline_exec_thread_pool_thread_num > 0 {
            return self.pipeline_exec_thread_pool_thread_num;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            pipeline_exec_thread_pool_thread_num: default_pipeline_exec_thread_pool_thread_num(),
            driver_time_slice_ms: default_driver_time_slice_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let cfg = NovaExecConfig::from_toml_str("").expect("parse empty config");
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.pool.capacity_bytes, 1 << 30);
        assert!(cfg.query.max_memory_bytes.is_none());
        assert_eq!(cfg.runtime.driver_time_slice_ms, 200);
        assert!(cfg.runtime.actual_exec_threads() >= 1);
    }

    #[test]
    fn camel_case_aliases_are_accepted() {
        let cfg = NovaExecConfig::from_toml_str(
            r#"
[pool]
capacityBytes = 10485760

[query]
maxMemoryBytes = 4096
maxTotalMemoryBytes = 8192
"#,
        )
        .expect("parse config");
        assert_eq!(cfg.pool.capacity_bytes, 10 << 20);
        assert_eq!(cfg.query.max_memory_bytes, Some(4096));
        assert_eq!(cfg.query.max_total_memory_bytes, Some(8192));
    }

    #[test]
    fn non_positive_capacity_is_rejected() {
        let err = NovaExecConfig::from_toml_str("[pool]\ncapacity_bytes = 0\n")
            .expect_err("zero capacity must fail");
        assert!(err.to_string().contains("capacity_bytes"));
    }

    #[test]
    fn log_filter_overrides_level() {
        let cfg = NovaExecConfig::from_toml_str(
            "log_level = \"warn\"\nlog_filter = \"novaexec=debug\"\n",
        )
        .expect("parse config");
        assert_eq!(cfg.effective_log_filter(), "novaexec=debug");
    }
}
