//! 许可证规则加载（TOML）
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

/// 内置默认规则（未指定 `--rules` 时使用）
pub const DEFAULT_RULES: &str = include_str!("../../../rules/default.toml");

/// 单条规则的配置（支持 pattern 或 regex 字段）
#[derive(Debug, Clone, Deserialize)]
struct RuleEntry {
    pub id: String,
    /// 命中后报告的许可证标识；缺省为 id
    #[serde(default)]
    pub license: Option<String>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub regex: Option<String>,
}

/// 顶层规则文件结构
#[derive(Debug, Clone, Deserialize)]
struct RuleFile {
    #[serde(default)]
    pub rules: Vec<RuleEntry>,
}

/// 归一化后的规则规格
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSpec {
    pub id: String,
    pub license: String,
    pub pat: String,
}

/// 从 TOML 规则文件加载并归一化为 RuleSpec 列表
pub fn load_rule_specs(path: &Path) -> Result<Vec<RuleSpec>> {
    let txt = std::fs::read_to_string(path).with_context(|| format!("read rules file {}", path.display()))?;
    parse_rule_specs(&txt).with_context(|| format!("parse rules file {}", path.display()))
}

/// 加载 `path` 指定的规则；为空时使用内置默认规则
pub fn load_rule_specs_or_default(path: Option<&Path>) -> Result<Vec<RuleSpec>> {
    match path {
        Some(p) => load_rule_specs(p),
        None => parse_rule_specs(DEFAULT_RULES).context("parse built-in rules"),
    }
}

/// 解析规则文本
pub fn parse_rule_specs(txt: &str) -> Result<Vec<RuleSpec>> {
    let parsed: RuleFile = toml::from_str(txt)?;
    let mut out = Vec::new();

    for e in parsed.rules {
        // 兼容两种字段名：pattern 或 regex
        let pat = match (e.pattern, e.regex) {
            (Some(p), _) => p,
            (None, Some(r)) => r,
            _ => continue,
        };
        let license = e.license.unwrap_or_else(|| e.id.clone());
        out.push(RuleSpec { id: e.id, license, pat });
    }

    Ok(out)
}
