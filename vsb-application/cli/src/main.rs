//! VSB CLI 应用

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "vsb")]
#[command(about = "VSB - vSphere 虚拟机克隆构建工具", long_about = None)]
#[command(version)]
struct Cli {
    /// 日志级别 (RUST_LOG 优先)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 执行构建
    Build {
        /// 构建配置文件 (.json / .toml)
        file: PathBuf,

        /// 以 JSON 输出产物
        #[arg(long)]
        json: bool,

        /// 将构建报告写入文件
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// 删除构建产物
    Destroy {
        /// 构建配置文件，用于连接信息
        file: PathBuf,

        /// 虚拟机 ID，如 vm-42
        #[arg(long)]
        vm: String,
    },

    /// 解析清单路径
    Path {
        /// 构建配置文件，用于连接信息与数据中心
        file: PathBuf,

        #[command(flatten)]
        query: PathQuery,
    },
}

/// 待解析的清单路径
#[derive(clap::Args)]
pub struct PathQuery {
    /// 虚拟机文件夹
    #[arg(long)]
    folder: Option<String>,

    /// 主机
    #[arg(long)]
    host: Option<String>,

    /// 数据存储
    #[arg(long)]
    datastore: Option<String>,

    /// 网络
    #[arg(long)]
    network: Option<String>,

    /// 虚拟机 (路径或唯一名称)
    #[arg(long)]
    vm: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 初始化日志
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.to_lowercase()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("VSB CLI 启动");

    match cli.command {
        Commands::Build { file, json, report } => {
            commands::build::handle(&file, json, report.as_deref()).await?
        }
        Commands::Destroy { file, vm } => commands::destroy::handle(&file, &vm).await?,
        Commands::Path { file, query } => commands::inspect::handle(&file, &query).await?,
    }

    Ok(())
}
