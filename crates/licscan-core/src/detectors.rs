//! 许可证检测器（Aho-Corasick 预筛 + bytes 正则）
//!
//! - 从每条规则的正则中抽取字面量锚点，构建全局（大小写不敏感）AC 自动机；
//! - 扫描时先跑一遍 AC，只对锚点命中的规则执行精准正则；
//! - 抽不出锚点（含锚点都在可选分组里）、或顶层含 `|` 的规则总是执行。
use std::collections::{HashMap, HashSet};

use aho_corasick::{AhoCorasick, AhoCorasickBuilder, MatchKind};
use anyhow::{Context, Result};
use tracing::warn;

use crate::rules::RuleSpec;

/// 锚点最小长度
const MIN_ANCHOR_LEN: usize = 3;

/// 已编译的单条规则
struct CompiledRule {
    license: String,
    re: regex::bytes::Regex,
}

/// 许可证检测器（只读，可跨线程共享）
pub struct LicenseDetector {
    rules: Vec<CompiledRule>,
    ac: Option<AhoCorasick>,
    /// 锚点索引 -> 规则索引列表
    anchor_to_rules: Vec<Vec<usize>>,
    /// 不参与预筛、每次都执行的规则
    always: Vec<usize>,
}

impl LicenseDetector {
    /// 从规则条目构建检测器；无法编译的正则记录告警后跳过
    pub fn from_specs(specs: &[RuleSpec]) -> Result<Self> {
        let mut rules = Vec::new();
        let mut anchors: Vec<String> = Vec::new();
        let mut anchor_index: HashMap<String, usize> = HashMap::new();
        let mut anchor_to_rules: Vec<Vec<usize>> = Vec::new();
        let mut always = Vec::new();

        for spec in specs {
            let re = match regex::bytes::Regex::new(&spec.pat) {
                Ok(re) => re,
                Err(err) => {
                    warn!(rule = %spec.id, %err, "skipping rule with invalid pattern");
                    continue;
                }
            };
            let rule_idx = rules.len();
            rules.push(CompiledRule { license: spec.license.clone(), re });

            let found = extract_anchors_from_pattern(&spec.pat);
            if found.is_empty() {
                always.push(rule_idx);
                continue;
            }
            for a in found {
                let id = *anchor_index.entry(a.clone()).or_insert_with(|| {
                    anchors.push(a);
                    anchor_to_rules.push(Vec::new());
                    anchors.len() - 1
                });
                anchor_to_rules[id].push(rule_idx);
            }
        }

        let ac = if anchors.is_empty() {
            None
        } else {
            Some(
                AhoCorasickBuilder::new()
                    .ascii_case_insensitive(true)
                    .match_kind(MatchKind::Standard)
                    .build(&anchors)
                    .context("build aho-corasick prefilter")?,
            )
        };

        Ok(Self { rules, ac, anchor_to_rules, always })
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// 检测缓冲区中的许可证
    ///
    /// 每条命中的规则报告一次，按首次命中偏移升序（相同偏移按规则顺序）。
    /// 不同规则报告相同许可证时保留重复项。
    pub fn detect(&self, buf: &[u8]) -> Vec<String> {
        let mut candidates: HashSet<usize> = self.always.iter().copied().collect();
        if let Some(ac) = &self.ac {
            for m in ac.find_overlapping_iter(buf) {
                candidates.extend(self.anchor_to_rules[m.pattern().as_usize()].iter().copied());
            }
        }

        let mut hits: Vec<(usize /*offset*/, usize /*rule*/, String)> = Vec::new();
        for ri in candidates {
            let rule = &self.rules[ri];
            let Some(caps) = rule.re.captures(buf) else { continue };
            let Some(m0) = caps.get(0) else { continue };
            // 优先使用第 1 个捕获组作为许可证标识
            let license = match caps.get(1) {
                Some(g1) if !g1.as_bytes().is_empty() => String::from_utf8_lossy(g1.as_bytes()).into_owned(),
                _ => rule.license.clone(),
            };
            hits.push((m0.start(), ri, license));
        }

        hits.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
        hits.into_iter().map(|(_, _, license)| license).collect()
    }
}

/// 从正则模式中抽取锚点（启发式）
/// - 提取不含元字符的连续字面量片段（长度≥3）；字符类、`{m,n}`、转义序列均视为分隔；
/// - 紧跟 `?`/`*`/`{` 的字符是可选的，从片段中去掉；`(?:`、`(?i)` 等组前缀跳过；
/// - 分组后跟 `?`/`*`/`{0,..}` 时整组可选，组内锚点全部丢弃；
/// - 组内有分支抽不出锚点时，该组不贡献锚点；
/// - 顶层出现 `|` 时返回空，交由调用方总是执行该规则。
///
/// 返回的任一锚点命中即视为候选，所以每个锚点都必须是匹配文本的必要部分。
fn extract_anchors_from_pattern(pat: &str) -> Vec<String> {
    // 每层分组按 `|` 切成若干分支，栈底是整个模式
    let mut groups: Vec<Vec<Vec<String>>> = vec![vec![Vec::new()]];
    let mut cur = String::new();
    let mut chars = pat.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '\\' => {
                flush_literal(&mut cur, &mut groups);
                chars.next();
            }
            '[' => {
                flush_literal(&mut cur, &mut groups);
                // 跳过字符类（含转义的 `]`）
                while let Some(c) = chars.next() {
                    match c {
                        '\\' => {
                            chars.next();
                        }
                        ']' => break,
                        _ => {}
                    }
                }
            }
            '{' => {
                cur.pop();
                flush_literal(&mut cur, &mut groups);
                for c in chars.by_ref() {
                    if c == '}' {
                        break;
                    }
                }
            }
            '?' | '*' => {
                cur.pop();
                flush_literal(&mut cur, &mut groups);
            }
            '(' => {
                flush_literal(&mut cur, &mut groups);
                // `(?i)` 只设置标志，不开启分组
                if chars.peek() == Some(&'?') {
                    let mut opens_group = false;
                    for c in chars.by_ref() {
                        if c == ':' {
                            opens_group = true;
                            break;
                        }
                        if c == ')' {
                            break;
                        }
                    }
                    if !opens_group {
                        continue;
                    }
                }
                groups.push(vec![Vec::new()]);
            }
            ')' => {
                flush_literal(&mut cur, &mut groups);
                if groups.len() < 2 {
                    continue;
                }
                let branches = groups.pop().unwrap_or_default();
                if group_is_optional(&chars) || branches.iter().any(Vec::is_empty) {
                    continue;
                }
                if let Some(branch) = groups.last_mut().and_then(|g| g.last_mut()) {
                    branch.extend(branches.into_iter().flatten());
                }
            }
            '|' if groups.len() == 1 => return Vec::new(),
            '|' => {
                flush_literal(&mut cur, &mut groups);
                if let Some(group) = groups.last_mut() {
                    group.push(Vec::new());
                }
            }
            '+' | '^' | '$' | '.' => flush_literal(&mut cur, &mut groups),
            _ => cur.push(ch),
        }
    }
    flush_literal(&mut cur, &mut groups);

    // 未闭合的分组不贡献锚点
    groups.truncate(1);
    let mut v: Vec<String> = groups.pop().into_iter().flatten().flatten().collect();
    // 排序以稳定（长度降序，字典序）
    v.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
    v.dedup();
    v
}

/// `)` 之后紧跟的量词是否允许分组出现零次
fn group_is_optional(rest: &std::iter::Peekable<std::str::Chars<'_>>) -> bool {
    let mut ahead = rest.clone();
    match ahead.next() {
        Some('?') | Some('*') => true,
        Some('{') => ahead.next() == Some('0'),
        _ => false,
    }
}

fn flush_literal(cur: &mut String, groups: &mut [Vec<Vec<String>>]) {
    let lit = cur.trim();
    if lit.len() >= MIN_ANCHOR_LEN {
        if let Some(branch) = groups.last_mut().and_then(|g| g.last_mut()) {
            branch.push(lit.to_string());
        }
    }
    cur.clear();
}
