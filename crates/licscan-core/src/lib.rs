//! 许可证扫描结果的跨进程输出库
//!
//! 设计要点：
//! - 每个 worker（进程或线程）扫描一个文件后产出一条独立的 JSON 记录，
//!   所有记录写到同一个输出流，外层由编排方包上 `[` `]` 组成一个 JSON 数组。
//! - 记录之间恰好一个逗号，无前导/尾随逗号：由协调器的共享标志与临界区内的写入纪律共同保证。
//! - 许可证检测（规则文件 + Aho-Corasick 预筛 + bytes 正则）在加锁之前完成，不串行化昂贵的工作。
//! - 记录中的 `\/` 会还原为字面 `/`。

mod options;
mod types;
mod unescape;
mod record;
mod sink;
mod coordinator;
mod rules;
mod detectors;
mod engine;
mod scan;

pub use options::{ScanOptions, ScanStats, WorkerMode};
pub use types::LicenseRecord;
pub use unescape::{count_escaped_separators, unescape_path_separators, UnescapeError, ESCAPED_SEPARATOR, PATH_SEPARATOR};
pub use record::{build_record, file_label, render_record, RecordError};
pub use sink::OutputSink;
pub use coordinator::{emit_record, Coordinator, CoordinatorError, OutputCoordinator, OutputState, ThreadCoordinator};
pub use rules::{load_rule_specs, load_rule_specs_or_default, parse_rule_specs, RuleSpec, DEFAULT_RULES};
pub use detectors::LicenseDetector;
pub use engine::detect_file;
pub use scan::{collect_files, partition, read_targets, run_worker, scan_and_write, WorkerContext, WORKER_SUBCOMMAND};
