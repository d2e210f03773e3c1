//! HPC cluster adapters over plain `ssh`, budgeted by the daily connection
//! counter. Supports PBS and Slurm schedulers.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use borealis_config::HpcConfig;
use borealis_ensemble::SshBudget;
use serde_json::json;
use tracing::info;

use crate::{Tool, ToolDef};

pub struct HpcRunner {
    config: HpcConfig,
    budget: Arc<SshBudget>,
}

impl HpcRunner {
    pub fn new(config: HpcConfig, budget: Arc<SshBudget>) -> Self {
        Self { config, budget }
    }

    fn target(&self) -> Result<String> {
        if self.config.host.is_empty() || self.config.username.is_empty() {
            anyhow::bail!("HPC profile not configured");
        }
        Ok(format!("{}@{}", self.config.username, self.config.host))
    }

    pub fn scheduler(&self) -> &str {
        &self.config.scheduler
    }

    pub fn username(&self) -> &str {
        &self.config.username
    }

    pub fn remote_path(&self) -> &str {
        &self.config.remote_path
    }

    /// Run one remote command; every invocation consumes one unit of the
    /// daily SSH budget.
    pub async fn run_remote(&self, remote_cmd: &str) -> Result<String> {
        let target = self.target()?;
        if !self.budget.check_daily_limit() {
            anyhow::bail!("daily SSH connection budget exhausted");
        }

        info!(%target, cmd = remote_cmd, "running remote command");
        let output = tokio::time::timeout(
            Duration::from_secs(self.config.ssh_timeout_secs),
            tokio::process::Command::new("ssh")
                .arg("-o")
                .arg("BatchMode=yes")
                .arg(&target)
                .arg(remote_cmd)
                .output(),
        )
        .await
        .map_err(|_| anyhow::anyhow!("ssh timed out after {}s", self.config.ssh_timeout_secs))??;

        self.budget.increment();

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("remote command failed: {}", stderr.trim());
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

pub struct CheckHpcConnectionTool {
    runner: Arc<HpcRunner>,
}

impl CheckHpcConnectionTool {
    pub fn new(runner: Arc<HpcRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl Tool for CheckHpcConnectionTool {
    fn def(&self) -> ToolDef {
        ToolDef {
            name: "check_hpc_connection".to_string(),
            description: "HPC 클러스터 SSH 연결 확인.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {},
                "required": []
            }),
        }
    }

    async fn run(&self, _args: &serde_json::Value) -> Result<String> {
        let output = self.runner.run_remote("echo ok").await?;
        Ok(json!({"connected": output.trim() == "ok"}).to_string())
    }
}

pub struct MonitorHpcJobTool {
    runner: Arc<HpcRunner>,
}

impl MonitorHpcJobTool {
    pub fn new(runner: Arc<HpcRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl Tool for MonitorHpcJobTool {
    fn def(&self) -> ToolDef {
        ToolDef {
            name: "monitor_hpc_job".to_string(),
            description: "HPC 잡 상태 조회. job_id 없으면 내 잡 전체 목록.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "job_id": {
                        "type": "string",
                        "description": "Specific job ID to check (optional)"
                    }
                },
                "required": []
            }),
        }
    }

    async fn run(&self, args: &serde_json::Value) -> Result<String> {
        let job_id = args.get("job_id").and_then(|v| v.as_str()).filter(|s| !s.is_empty());
        let command = match (self.runner.scheduler(), job_id) {
            ("slurm", Some(id)) => format!("squeue -j {id}"),
            ("slurm", None) => format!("squeue -u {}", self.runner.username()),
            (_, Some(id)) => format!("qstat {id}"),
            (_, None) => format!("qstat -u {}", self.runner.username()),
        };
        let output = self.runner.run_remote(&command).await?;
        Ok(json!({
            "scheduler": self.runner.scheduler(),
            "output": output.trim(),
        })
        .to_string())
    }
}

pub struct SubmitHpcJobTool {
    runner: Arc<HpcRunner>,
}

impl SubmitHpcJobTool {
    pub fn new(runner: Arc<HpcRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl Tool for SubmitHpcJobTool {
    fn def(&self) -> ToolDef {
        ToolDef {
            name: "submit_hpc_job".to_string(),
            description: "HPC 잡 제출. 원격 스크립트를 스케줄러 큐에 넣음.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "script_path": {
                        "type": "string",
                        "description": "Path of the job script on the cluster"
                    }
                },
                "required": ["script_path"]
            }),
        }
    }

    async fn run(&self, args: &serde_json::Value) -> Result<String> {
        let script_path = args
            .get("script_path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing required param: script_path"))?;

        let submit = match self.runner.scheduler() {
            "slurm" => "sbatch",
            _ => "qsub",
        };
        let command = if self.runner.remote_path().is_empty() {
            format!("{submit} {script_path}")
        } else {
            format!("cd {} && {submit} {script_path}", self.runner.remote_path())
        };
        let output = self.runner.run_remote(&command).await?;
        Ok(json!({"submitted": true, "output": output.trim()}).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner(host: &str) -> Arc<HpcRunner> {
        let dir = tempfile::tempdir().unwrap();
        let budget = Arc::new(SshBudget::new(dir.path().join("ssh_counter.json"), 10, 0));
        let config = HpcConfig {
            host: host.to_string(),
            scheduler: "pbs".to_string(),
            username: if host.is_empty() { String::new() } else { "jo".to_string() },
            remote_path: String::new(),
            ssh_timeout_secs: 5,
        };
        Arc::new(HpcRunner::new(config, budget))
    }

    #[tokio::test]
    async fn unconfigured_profile_errors() {
        let tool = CheckHpcConnectionTool::new(runner(""));
        let err = tool.run(&json!({})).await.unwrap_err();
        assert!(err.to_string().contains("not configured"));
    }

    #[test]
    fn monitor_has_no_required_params_submit_does() {
        let r = runner("cluster.example.edu");
        assert!(MonitorHpcJobTool::new(r.clone()).def().required_params().is_empty());
        assert_eq!(
            SubmitHpcJobTool::new(r).def().required_params(),
            vec!["script_path"]
        );
    }
}
