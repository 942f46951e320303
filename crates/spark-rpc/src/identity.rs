//! 对象身份：分发目标在适配器内的唯一键。

use std::fmt;
use std::str::FromStr;

use spark_rpc_wire::{InputStream, OutputStream, WireResult};

use crate::error::RpcError;

/// `{name, category}` 二元组。
///
/// # 教案级注释
///
/// ## 契约（What）
/// - 不可变值类型，可作为哈希表键；
/// - 字符串形式为 `category/name`，类别为空时只写 `name`；
///   名称或类别中的 `/` 与 `\` 以 `\` 转义；
/// - 线格式依次写 `name`、`category` 两个字符串。
///
/// ## 注意事项（Trade-offs）
/// - 名称为空的身份只在“无目标”场景合法（如空代理），分发前由适配器校验。
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity {
    /// 名称。
    pub name: String,
    /// 类别，决定默认 servant 与定位器的选择。
    pub category: String,
}

impl Identity {
    /// 构造身份。
    pub fn new(name: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            category: category.into(),
        }
    }

    /// 以随机 UUID 为名称、空类别构造身份。
    pub fn uuid() -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), "")
    }

    /// 名称是否为空。
    pub fn is_empty(&self) -> bool {
        self.name.is_empty()
    }

    /// 写入线格式。
    pub fn write(&self, out: &mut OutputStream) {
        out.write_string(&self.name);
        out.write_string(&self.category);
    }

    /// 从线格式读取。
    pub fn read(input: &mut InputStream<'_>) -> WireResult<Self> {
        let name = input.read_string()?;
        let category = input.read_string()?;
        Ok(Self { name, category })
    }
}

fn escape(raw: &str, out: &mut String) {
    for ch in raw.chars() {
        if ch == '/' || ch == '\\' {
            out.push('\\');
        }
        out.push(ch);
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut text = String::with_capacity(self.name.len() + self.category.len() + 1);
        if !self.category.is_empty() {
            escape(&self.category, &mut text);
            text.push('/');
        }
        escape(&self.name, &mut text);
        f.write_str(&text)
    }
}

impl FromStr for Identity {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let illegal = || RpcError::IllegalIdentity(s.to_owned());
        let mut parts: Vec<String> = Vec::new();
        let mut current = String::new();
        let mut chars = s.chars();
        while let Some(ch) = chars.next() {
            match ch {
                '\\' => current.push(chars.next().ok_or_else(illegal)?),
                '/' => parts.push(std::mem::take(&mut current)),
                other => current.push(other),
            }
        }
        let identity = match parts.pop() {
            None => Identity::new(current, ""),
            Some(category) if parts.is_empty() => Identity::new(current, category),
            Some(_) => return Err(illegal()),
        };
        if identity.name.is_empty() {
            return Err(illegal());
        }
        Ok(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_form_escapes_separators() {
        let id = Identity::new("a/b", "c\\d");
        let text = id.to_string();
        assert_eq!(text, "c\\\\d/a\\/b");
        assert_eq!(text.parse::<Identity>().expect("合法身份"), id);
        assert_eq!(
            "hello".parse::<Identity>().expect("合法身份"),
            Identity::new("hello", "")
        );
    }

    #[test]
    fn malformed_strings_are_rejected() {
        assert!("a/b/c".parse::<Identity>().is_err());
        assert!("cat/".parse::<Identity>().is_err());
        assert!("trailing\\".parse::<Identity>().is_err());
    }

    #[test]
    fn wire_form_is_name_then_category() {
        let id = Identity::new("obj", "cat");
        let mut out = OutputStream::new();
        id.write(&mut out);
        let bytes = out.into_bytes();
        assert_eq!(&bytes[..], b"\x03obj\x03cat");
        let mut input = InputStream::new(&bytes);
        assert_eq!(Identity::read(&mut input).expect("解码身份"), id);
    }
}
