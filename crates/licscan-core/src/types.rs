//! 公共类型（对外暴露）
use serde::Serialize;

/// 单个文件的许可证记录（输出 JSON 数组中的一个元素）
///
/// 字段顺序即序列化顺序：先 `file` 后 `licenses`。
/// `licenses` 保持检测引擎给出的顺序，重复项原样保留；为空时序列化为 `[]`。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LicenseRecord {
    pub file: String,
    pub licenses: Vec<String>,
}
