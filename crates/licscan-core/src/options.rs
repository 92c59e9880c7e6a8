//! 扫描选项与统计信息（模块）
use std::path::PathBuf;

/// worker 并发模型
/// - Processes：派生多个 worker 进程，经锁文件协调输出（默认）。
/// - Threads：单进程内线程池，经进程内互斥锁协调输出。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerMode {
    Processes,
    Threads,
}

/// 扫描选项
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// `file` 字段是否输出解析后的绝对路径（`--long`）
    pub resolve_absolute: bool,
    /// 最大文件大小（字节）；超过则跳过，不输出记录
    pub max_file_size: Option<u64>,
    /// 规则文件路径（TOML）；为空则使用内置规则
    pub rules_path: Option<PathBuf>,
    /// worker 数：None 表示自动（等于 CPU 核数）
    pub jobs: Option<usize>,
    pub mode: WorkerMode,
    /// 目录输入时是否递归（默认只扫描第一层）
    pub recursive: bool,
    /// 进程模式下 worker 的可执行文件；None 表示当前可执行文件
    pub worker_program: Option<PathBuf>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            resolve_absolute: false,
            max_file_size: None,
            rules_path: None,
            jobs: None,
            mode: WorkerMode::Processes,
            recursive: false,
            worker_program: None,
        }
    }
}

/// 扫描统计信息（便于 CLI 打印）
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanStats {
    pub files_scanned: usize,
    pub records_written: usize,
    pub workers: usize,
}
