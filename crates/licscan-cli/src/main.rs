use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use licscan_core::{run_worker, scan_and_write, OutputSink, ScanOptions, WorkerMode};
use std::fs::File;
use std::io;
use std::path::PathBuf;
use tracing::info;

/// 命令行入口（基于 clap）
#[derive(Parser, Debug)]
#[command(name = "licscan", version, about = "许可证扫描，结果以 JSON 数组输出")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 扫描文件或目录，输出 JSON 数组
    Scan {
        /// 输入文件或目录
        #[arg(long)]
        input: PathBuf,

        /// 输出文件；缺省写到标准输出
        #[arg(long)]
        output: Option<PathBuf>,

        /// worker 数（"auto"=CPU 核心数）
        #[arg(long, default_value = "auto")]
        jobs: String,

        /// 并发模型：processes（多进程）或 threads（单进程多线程）
        #[arg(long, value_enum, default_value_t = Mode::Processes)]
        mode: Mode,

        /// `file` 字段输出解析后的绝对路径
        #[arg(long)]
        long: bool,

        /// 规则文件路径（TOML），缺省使用内置规则
        #[arg(long)]
        rules: Option<PathBuf>,

        /// 最大扫描文件大小（单位字节）
        #[arg(long)]
        max_file_size: Option<u64>,

        /// 递归扫描子目录
        #[arg(long)]
        recursive: bool,
    },

    /// 进程模式下由 scan 派生的 worker；从标准输入读取目标路径
    #[command(hide = true)]
    Worker {
        /// 协调器句柄（锁文件路径）
        #[arg(long)]
        coordinator: PathBuf,

        #[arg(long)]
        long: bool,

        #[arg(long)]
        rules: Option<PathBuf>,

        #[arg(long)]
        max_file_size: Option<u64>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    Processes,
    Threads,
}

impl From<Mode> for WorkerMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Processes => WorkerMode::Processes,
            Mode::Threads => WorkerMode::Threads,
        }
    }
}

fn main() -> Result<()> {
    // 初始化日志（支持通过 RUST_LOG 控制等级，例如 info、debug）
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Scan { input, output, jobs, mode, long, rules, max_file_size, recursive } => {
            info!(?input, ?output, "starting scan");

            let sink = match &output {
                Some(path) => OutputSink::File(File::create(path).context("create output file")?),
                None => OutputSink::Stdout,
            };
            let opts = ScanOptions {
                resolve_absolute: long,
                max_file_size,
                rules_path: rules,
                jobs: parse_jobs(&jobs),
                mode: mode.into(),
                recursive,
                worker_program: None,
            };
            let stats = scan_and_write(&input, &sink, &opts).context("scan and write failed")?;

            info!(
                files_scanned = stats.files_scanned,
                records_written = stats.records_written,
                workers = stats.workers,
                "scan finished"
            );
        }
        Commands::Worker { coordinator, long, rules, max_file_size } => {
            let opts = ScanOptions { resolve_absolute: long, max_file_size, rules_path: rules, ..ScanOptions::default() };
            run_worker(&coordinator, &OutputSink::Stdout, &opts, io::stdin().lock()).context("worker failed")?;
        }
    }

    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, FmtSubscriber};
    // 日志写到 stderr，stdout 只承载 JSON
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(env_filter).with_writer(io::stderr).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// 解析 worker 数参数
fn parse_jobs(s: &str) -> Option<usize> {
    if s.eq_ignore_ascii_case("auto") { return None; }
    match s.parse::<usize>() {
        Ok(n) if n >= 1 => Some(n),
        _ => None,
    }
}
