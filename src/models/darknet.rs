// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! darknet 网络定义 (.cfg) 解析与类别名加载

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

/// 网络定义中与检测后端相关的字段
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DarknetCfg {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub channels: Option<u32>,
    /// 最后一个 `[yolo]` / `[region]` 段的 `classes`
    pub classes: Option<usize>,
}

impl DarknetCfg {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read network definition {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("invalid network definition {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut cfg = DarknetCfg::default();
        let mut section = String::new();

        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if line.starts_with('[') {
                section = line
                    .trim_start_matches('[')
                    .trim_end_matches(']')
                    .trim()
                    .to_ascii_lowercase();
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                anyhow::bail!("line {}: expected `key=value`, got `{}`", lineno + 1, line);
            };
            let key = key.trim();
            let value = value.trim();

            match (section.as_str(), key) {
                ("net" | "network", "width") => cfg.width = Some(parse_num(value, lineno)?),
                ("net" | "network", "height") => cfg.height = Some(parse_num(value, lineno)?),
                ("net" | "network", "channels") => cfg.channels = Some(parse_num(value, lineno)?),
                ("yolo" | "region" | "detection", "classes") => {
                    cfg.classes = Some(parse_num(value, lineno)?)
                }
                _ => {}
            }
        }
        Ok(cfg)
    }
}

fn parse_num<T: std::str::FromStr>(value: &str, lineno: usize) -> Result<T> {
    value
        .parse::<T>()
        .map_err(|_| anyhow::anyhow!("line {}: `{}` is not a number", lineno + 1, value))
}

/// 读取类别名文件, 每行一个, 忽略空行
pub fn load_class_names(path: impl AsRef<Path>) -> Result<Vec<String>> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read class names {}", path.display()))?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect())
}
