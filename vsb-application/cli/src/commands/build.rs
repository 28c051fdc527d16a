//! Build 命令处理

use std::error::Error;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use colored::Colorize;
use tracing::warn;
use vsb_builder::{BuildOutcome, Builder, Cleanup, StepStatus};

pub async fn handle(file: &Path, json: bool, report_path: Option<&Path>) -> Result<()> {
    let config = super::load_config(file)?;
    let builder = Builder::new(config).context("构建配置无效")?;

    println!(
        "{} 构建 {} (源: {})",
        "▶".cyan().bold(),
        builder.config().vm_name.cyan(),
        builder.config().template
    );

    // Ctrl-C 取消构建，已创建的虚拟机会被清理
    let token = builder.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("收到中断信号，取消构建");
            token.cancel();
        }
    });

    let outcome = builder.run().await;
    print_steps(&outcome);

    if let Some(path) = report_path {
        let report = outcome.report.to_json()?;
        fs::write(path, report)
            .with_context(|| format!("无法写入构建报告: {}", path.display()))?;
        println!("报告已保存: {}", path.display());
    }

    match &outcome.result {
        Ok(artifact) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&outcome.artifacts())?);
            } else {
                println!();
                println!("{} 构建完成: {}", "✓".green().bold(), artifact.to_string().green());
            }
            Ok(())
        }
        Err(failure) => {
            println!();
            println!("{} {}", "✗".red().bold(), failure.to_string().red());
            let mut source = failure.error.source().and_then(|e| e.source());
            while let Some(cause) = source {
                println!("  {} {}", "原因:".bright_black(), cause);
                source = cause.source();
            }
            match &failure.cleanup {
                Cleanup::NotNeeded => {}
                Cleanup::Destroyed(vm) => println!("  已清理: {}", vm),
                Cleanup::Failed { vm, error } => println!(
                    "  {} 清理 {} 失败: {}",
                    "!".yellow().bold(),
                    vm,
                    error
                ),
            }
            if json {
                println!("{}", serde_json::to_string_pretty(&outcome.artifacts())?);
            }
            anyhow::bail!("构建失败")
        }
    }
}

fn print_steps(outcome: &BuildOutcome) {
    println!();
    for step in &outcome.report.steps {
        let marker = match step.status {
            StepStatus::Success => "✓".green(),
            StepStatus::Failed => "✗".red(),
            StepStatus::Skipped => "-".bright_black(),
        };
        println!(
            "  {} {:<22} {:>8} ms",
            marker,
            step.stage.to_string(),
            step.duration_ms
        );
    }
    println!(
        "  总耗时: {} ms",
        outcome.report.duration_ms.to_string().yellow()
    );
}
