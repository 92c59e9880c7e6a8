//! 扫描主流程：单文件入口、worker 循环与编排（进程 / 线程）
//!
//! 输出格式：`[` + 以逗号分隔的记录片段（每条后跟换行）+ `]`。
//! - 许可证检测在加锁之前完成，临界区内只做逗号判定、写入与刷新；
//! - 记录之间的先后顺序由调度决定，不保证与文件顺序一致。
use anyhow::{bail, Context, Result};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::coordinator::{emit_record, Coordinator, OutputCoordinator, ThreadCoordinator};
use crate::detectors::LicenseDetector;
use crate::engine::detect_file;
use crate::options::{ScanOptions, ScanStats, WorkerMode};
use crate::record::build_record;
use crate::rules::{load_rule_specs_or_default, RuleSpec};
use crate::sink::OutputSink;

/// 进程模式下 worker 的子命令名
pub const WORKER_SUBCOMMAND: &str = "worker";

/// 单个 worker 处理文件所需的全部上下文
pub struct WorkerContext<'a, C> {
    pub detector: &'a LicenseDetector,
    pub coordinator: &'a C,
    pub sink: &'a OutputSink,
    pub resolve_absolute: bool,
    pub max_file_size: Option<u64>,
}

impl<'a, C: Coordinator> WorkerContext<'a, C> {
    /// 处理单个文件：检测 → 构建记录 → 持锁写出
    ///
    /// 返回 `Ok(true)` 表示写出了记录，`Ok(false)` 表示跳过（过大或不可读）。
    /// 记录构建或协调器失败返回错误，调用方应中止整个流程。
    pub fn write_record(&self, target: &Path) -> Result<bool> {
        if let Some(max) = self.max_file_size {
            if let Ok(md) = std::fs::metadata(target) {
                if md.len() > max {
                    debug!(path = %target.display(), size = md.len(), max, "file too large, skipped");
                    return Ok(false);
                }
            }
        }

        let licenses = match detect_file(target, self.detector) {
            Ok(licenses) => licenses,
            Err(err) => {
                warn!(path = %target.display(), error = %format!("{err:#}"), "skipping unreadable file");
                return Ok(false);
            }
        };

        let record = build_record(target, licenses, self.resolve_absolute)
            .with_context(|| format!("build record for {}", target.display()))?;
        emit_record(self.coordinator, self.sink, &record).context("emit record")?;
        Ok(true)
    }

    /// 串行处理一组文件（进程模式下每个 worker 的主循环）
    pub fn run<I>(&self, targets: I) -> Result<ScanStats>
    where
        I: IntoIterator<Item = PathBuf>,
    {
        let mut stats = ScanStats { workers: 1, ..ScanStats::default() };
        for target in targets {
            stats.files_scanned += 1;
            if self.write_record(&target)? {
                stats.records_written += 1;
            }
        }
        Ok(stats)
    }
}

/// 枚举待扫描文件：单个文件原样返回；目录默认只取第一层，`recursive` 时递归
/// 结果按路径排序，保证分发稳定
pub fn collect_files(input: &Path, recursive: bool) -> Result<Vec<PathBuf>> {
    let md = std::fs::metadata(input).with_context(|| format!("stat input {}", input.display()))?;
    if md.is_file() {
        return Ok(vec![input.to_path_buf()]);
    }

    let max_depth = if recursive { usize::MAX } else { 1 };
    let mut files: Vec<PathBuf> = vec![];
    for entry in WalkDir::new(input).min_depth(1).max_depth(max_depth) {
        let entry = match entry {
            Ok(e) => e,
            Err(err) => {
                warn!(%err, "skipping unreadable directory entry");
                continue;
            }
        };
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}

/// 按轮转方式把文件分给 `jobs` 个 worker（空分组丢弃）
pub fn partition(files: Vec<PathBuf>, jobs: usize) -> Vec<Vec<PathBuf>> {
    let jobs = jobs.max(1);
    let mut shares: Vec<Vec<PathBuf>> = vec![Vec::new(); jobs];
    for (i, f) in files.into_iter().enumerate() {
        shares[i % jobs].push(f);
    }
    shares.retain(|s| !s.is_empty());
    shares
}

/// 目标列表中路径之间的分隔符；路径本身不可能含 NUL
const TARGET_SEPARATOR: u8 = 0;

/// 从 worker 的标准输入读取目标路径（原始字节，以 NUL 分隔，忽略空项）
pub fn read_targets<R: BufRead>(reader: R) -> Result<Vec<PathBuf>> {
    let mut targets = Vec::new();
    for raw in reader.split(TARGET_SEPARATOR) {
        let raw = raw.context("read target list")?;
        if !raw.is_empty() {
            targets.push(path_from_bytes(raw)?);
        }
    }
    Ok(targets)
}

/// worker 进程入口：连接协调器，处理 `targets` 中的文件，记录写到 `sink`
pub fn run_worker<R: BufRead>(coordinator_handle: &Path, sink: &OutputSink, opts: &ScanOptions, targets: R) -> Result<ScanStats> {
    let coordinator = OutputCoordinator::attach(coordinator_handle).context("attach to output coordinator")?;
    let specs = load_rule_specs_or_default(opts.rules_path.as_deref())?;
    let detector = LicenseDetector::from_specs(&specs)?;
    let targets = read_targets(targets)?;

    let ctx = WorkerContext {
        detector: &detector,
        coordinator: &coordinator,
        sink,
        resolve_absolute: opts.resolve_absolute,
        max_file_size: opts.max_file_size,
    };
    let stats = ctx.run(targets)?;
    debug!(pid = std::process::id(), files = stats.files_scanned, records = stats.records_written, "worker finished");
    Ok(stats)
}

/// 扫描 `input` 并将结果以 JSON 数组写入 `sink`
pub fn scan_and_write(input: &Path, sink: &OutputSink, opts: &ScanOptions) -> Result<ScanStats> {
    // 规则在编排进程里先加载一次，错误尽早暴露
    let specs = load_rule_specs_or_default(opts.rules_path.as_deref())?;
    let files = collect_files(input, opts.recursive)?;
    let jobs = opts.jobs.unwrap_or_else(num_cpus::get).clamp(1, files.len().max(1));
    info!(files = files.len(), jobs, mode = ?opts.mode, "dispatching files");

    sink.write_raw("[").context("write array start")?;
    let stats = match opts.mode {
        WorkerMode::Threads => scan_with_threads(&files, sink, opts, &specs, jobs)?,
        WorkerMode::Processes => scan_with_processes(files, sink, opts, jobs)?,
    };
    sink.write_raw("]\n").context("write array end")?;
    Ok(stats)
}

/// 线程模式：Rayon 线程池 + 进程内互斥锁
fn scan_with_threads(
    files: &[PathBuf],
    sink: &OutputSink,
    opts: &ScanOptions,
    specs: &[RuleSpec],
    jobs: usize,
) -> Result<ScanStats> {
    use rayon::prelude::*;

    let detector = LicenseDetector::from_specs(specs)?;
    let coordinator = ThreadCoordinator::new();
    let ctx = WorkerContext {
        detector: &detector,
        coordinator: &coordinator,
        sink,
        resolve_absolute: opts.resolve_absolute,
        max_file_size: opts.max_file_size,
    };

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(jobs)
        .build()
        .context("build rayon pool")?;
    pool.install(|| files.par_iter().try_for_each(|path| ctx.write_record(path).map(|_| ())))?;

    let state = coordinator.snapshot()?;
    Ok(ScanStats { files_scanned: files.len(), records_written: state.records_written as usize, workers: jobs })
}

/// 进程模式：先创建协调器，再派生 worker 进程，全部退出后销毁
fn scan_with_processes(files: Vec<PathBuf>, sink: &OutputSink, opts: &ScanOptions, jobs: usize) -> Result<ScanStats> {
    let program = match &opts.worker_program {
        Some(p) => p.clone(),
        None => std::env::current_exe().context("locate worker executable")?,
    };
    let mut files_scanned = 0usize;

    let coordinator = OutputCoordinator::initialize().context("initialize output coordinator")?;

    let mut children: Vec<Child> = Vec::new();
    let mut spawn_err = None;
    for (idx, share) in partition(files, jobs).into_iter().enumerate() {
        match spawn_worker(&program, &coordinator, sink, opts, &share) {
            Ok((child, sent)) => {
                debug!(worker = idx, pid = child.id(), files = sent, "worker spawned");
                files_scanned += sent;
                children.push(child);
            }
            Err(err) => {
                spawn_err = Some(err);
                break;
            }
        }
    }

    // 无论派生是否全部成功，都要等已启动的 worker 退出后才能销毁协调器
    let workers = children.len();
    let mut failed = 0usize;
    for mut child in children {
        let pid = child.id();
        match child.wait() {
            Ok(status) if status.success() => {}
            Ok(status) => {
                warn!(pid, %status, "worker exited unsuccessfully");
                failed += 1;
            }
            Err(err) => {
                warn!(pid, %err, "failed to wait for worker");
                failed += 1;
            }
        }
    }

    let state = coordinator.snapshot().context("read output coordinator state")?;
    coordinator.teardown().context("destroy output coordinator")?;

    if let Some(err) = spawn_err {
        return Err(err);
    }
    if failed > 0 {
        bail!("{failed} of {workers} worker processes failed");
    }
    Ok(ScanStats { files_scanned, records_written: state.records_written as usize, workers })
}

fn spawn_worker(
    program: &Path,
    coordinator: &OutputCoordinator,
    sink: &OutputSink,
    opts: &ScanOptions,
    share: &[PathBuf],
) -> Result<(Child, usize)> {
    let mut cmd = Command::new(program);
    cmd.arg(WORKER_SUBCOMMAND).arg("--coordinator").arg(coordinator.handle());
    if opts.resolve_absolute {
        cmd.arg("--long");
    }
    if let Some(rules) = &opts.rules_path {
        cmd.arg("--rules").arg(rules);
    }
    if let Some(max) = opts.max_file_size {
        cmd.arg("--max-file-size").arg(max.to_string());
    }
    cmd.stdin(Stdio::piped())
        .stdout(sink.child_stdio().context("share output with worker")?)
        .stderr(Stdio::inherit());

    let mut child = cmd.spawn().with_context(|| format!("spawn worker {}", program.display()))?;
    let written = match child.stdin.take() {
        // 写完后关闭 stdin，worker 读到 EOF 开始处理
        Some(mut stdin) => write_targets(&mut stdin, share),
        None => Err(anyhow::anyhow!("worker stdin not captured")),
    };
    match written {
        Ok(sent) => Ok((child, sent)),
        Err(err) => {
            let _ = child.kill();
            let _ = child.wait();
            Err(err)
        }
    }
}

/// 把目标路径写给 worker，返回实际发送的条数
fn write_targets<W: Write>(out: &mut W, share: &[PathBuf]) -> Result<usize> {
    let mut sent = 0usize;
    for path in share {
        let Some(raw) = path_bytes(path) else {
            warn!(path = ?path, "skipping path that cannot be passed to a worker");
            continue;
        };
        out.write_all(raw).context("send target list to worker")?;
        out.write_all(&[TARGET_SEPARATOR]).context("send target list to worker")?;
        sent += 1;
    }
    out.flush().context("send target list to worker")?;
    Ok(sent)
}

#[cfg(unix)]
fn path_bytes(path: &Path) -> Option<&[u8]> {
    use std::os::unix::ffi::OsStrExt;
    Some(path.as_os_str().as_bytes())
}

#[cfg(not(unix))]
fn path_bytes(path: &Path) -> Option<&[u8]> {
    path.to_str().map(str::as_bytes)
}

#[cfg(unix)]
fn path_from_bytes(raw: Vec<u8>) -> Result<PathBuf> {
    use std::os::unix::ffi::OsStringExt;
    Ok(PathBuf::from(std::ffi::OsString::from_vec(raw)))
}

#[cfg(not(unix))]
fn path_from_bytes(raw: Vec<u8>) -> Result<PathBuf> {
    String::from_utf8(raw).map(PathBuf::from).context("target path is not UTF-8")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::fs;

    fn fixture_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("mit.txt"),
            "Permission is hereby granted, free of charge, to any person obtaining a copy",
        )
        .unwrap();
        fs::write(dir.path().join("spdx.c"), "/* SPDX-License-Identifier: GPL-2.0-only */\n").unwrap();
        fs::write(dir.path().join("empty.txt"), "").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub").join("nested.txt"), "The MIT License").unwrap();
        dir
    }

    fn parse_array(text: &str) -> Vec<Value> {
        let v: Value = serde_json::from_str(text).expect("output is a JSON array");
        v.as_array().unwrap().clone()
    }

    #[test]
    fn threads_mode_emits_valid_array() {
        let dir = fixture_dir();
        let sink = OutputSink::buffer();
        let opts = ScanOptions { mode: WorkerMode::Threads, jobs: Some(4), ..ScanOptions::default() };

        let stats = scan_and_write(dir.path(), &sink, &opts).unwrap();
        let out = sink.contents().unwrap();
        let items = parse_array(&out);

        assert_eq!(items.len(), 3);
        assert_eq!(stats.records_written, 3);
        assert_eq!(out.matches("\n,").count(), 2);
        assert!(!out.starts_with("[,"));

        let mut by_file: Vec<(String, Value)> = items
            .iter()
            .map(|i| (i["file"].as_str().unwrap().to_string(), i["licenses"].clone()))
            .collect();
        by_file.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            by_file,
            vec![
                ("empty.txt".to_string(), serde_json::json!([])),
                ("mit.txt".to_string(), serde_json::json!(["MIT"])),
                ("spdx.c".to_string(), serde_json::json!(["GPL-2.0-only"])),
            ]
        );
    }

    #[test]
    fn recursive_threads_mode_includes_nested_files() {
        let dir = fixture_dir();
        let sink = OutputSink::buffer();
        let opts = ScanOptions { mode: WorkerMode::Threads, jobs: Some(2), recursive: true, ..ScanOptions::default() };
        scan_and_write(dir.path(), &sink, &opts).unwrap();
        let items = parse_array(&sink.contents().unwrap());
        assert_eq!(items.len(), 4);
        assert!(items.iter().any(|i| i["file"] == "nested.txt" && i["licenses"] == serde_json::json!(["MIT"])));
    }

    #[test]
    fn empty_directory_yields_empty_array() {
        let dir = tempfile::tempdir().unwrap();
        let sink = OutputSink::buffer();
        let opts = ScanOptions { mode: WorkerMode::Threads, ..ScanOptions::default() };
        let stats = scan_and_write(dir.path(), &sink, &opts).unwrap();
        assert_eq!(sink.contents().unwrap(), "[]\n");
        assert_eq!(stats.records_written, 0);
    }

    #[test]
    fn write_record_skips_large_and_missing_files() {
        let dir = fixture_dir();
        let detector = LicenseDetector::from_specs(&load_rule_specs_or_default(None).unwrap()).unwrap();
        let coordinator = ThreadCoordinator::new();
        let sink = OutputSink::buffer();
        let ctx = WorkerContext {
            detector: &detector,
            coordinator: &coordinator,
            sink: &sink,
            resolve_absolute: false,
            max_file_size: Some(10),
        };

        assert!(!ctx.write_record(&dir.path().join("mit.txt")).unwrap());
        assert!(!ctx.write_record(&dir.path().join("missing.txt")).unwrap());
        assert!(ctx.write_record(&dir.path().join("empty.txt")).unwrap());
        assert_eq!(coordinator.snapshot().unwrap().records_written, 1);
        assert!(!sink.contents().unwrap().starts_with(','));
    }

    #[test]
    fn worker_reads_targets_and_shares_flag_with_orchestrator() {
        let dir = fixture_dir();
        let owner = OutputCoordinator::initialize().unwrap();
        let sink = OutputSink::buffer();
        let mut list = Vec::new();
        write_targets(&mut list, &[dir.path().join("mit.txt"), dir.path().join("spdx.c")]).unwrap();
        list.push(TARGET_SEPARATOR);

        let stats = run_worker(owner.handle(), &sink, &ScanOptions::default(), list.as_slice()).unwrap();
        assert_eq!(stats.files_scanned, 2);
        assert_eq!(stats.records_written, 2);
        assert_eq!(owner.snapshot().unwrap().records_written, 2);

        let items = parse_array(&format!("[{}]", sink.contents().unwrap()));
        assert_eq!(items.len(), 2);
        owner.teardown().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn target_list_carries_newlines_and_non_utf8_names() {
        use std::os::unix::ffi::OsStrExt;
        let odd = vec![
            PathBuf::from("dir/line\nbreak.txt"),
            PathBuf::from(std::ffi::OsStr::from_bytes(b"latin1-\xe9.txt")),
            PathBuf::from("plain.txt"),
        ];
        let mut list = Vec::new();
        assert_eq!(write_targets(&mut list, &odd).unwrap(), 3);
        assert_eq!(read_targets(list.as_slice()).unwrap(), odd);
    }

    #[cfg(unix)]
    #[test]
    fn processes_and_threads_agree_on_newline_names() {
        let dir = fixture_dir();
        fs::write(dir.path().join("two\nlines.txt"), "The MIT License").unwrap();
        let share = [dir.path().join("two\nlines.txt"), dir.path().join("mit.txt")];

        let owner = OutputCoordinator::initialize().unwrap();
        let sink = OutputSink::buffer();
        let mut list = Vec::new();
        assert_eq!(write_targets(&mut list, &share).unwrap(), 2);
        let stats = run_worker(owner.handle(), &sink, &ScanOptions::default(), list.as_slice()).unwrap();
        owner.teardown().unwrap();

        assert_eq!(stats.files_scanned, 2);
        let items = parse_array(&format!("[{}]", sink.contents().unwrap()));
        assert!(items.iter().any(|i| i["file"] == "two\nlines.txt" && i["licenses"] == serde_json::json!(["MIT"])));

        let threads = OutputSink::buffer();
        let opts = ScanOptions { mode: WorkerMode::Threads, jobs: Some(2), ..ScanOptions::default() };
        let stats = scan_and_write(dir.path(), &threads, &opts).unwrap();
        assert_eq!(stats.files_scanned, 4);
        assert!(parse_array(&threads.contents().unwrap()).iter().any(|i| i["file"] == "two\nlines.txt"));
    }

    #[test]
    fn partition_round_robin() {
        let files: Vec<PathBuf> = (0..5).map(|i| PathBuf::from(format!("f{i}"))).collect();
        let shares = partition(files, 3);
        assert_eq!(shares.len(), 3);
        assert_eq!(shares[0], vec![PathBuf::from("f0"), PathBuf::from("f3")]);
        assert_eq!(shares[2], vec![PathBuf::from("f2")]);
        assert_eq!(partition(vec![PathBuf::from("a")], 8).len(), 1);
        assert!(partition(Vec::new(), 2).is_empty());
    }

    #[test]
    fn single_file_input() {
        let dir = fixture_dir();
        let path = dir.path().join("mit.txt");
        assert_eq!(collect_files(&path, false).unwrap(), vec![path]);
        assert!(collect_files(&dir.path().join("nope"), false).is_err());
    }
}
