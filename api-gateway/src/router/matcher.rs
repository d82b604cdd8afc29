/* router/matcher.rs */

use common::error::Error;

/// 路径模式中的一段
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Static(String),
    /// `{id}` 或 `:id`
    Param(String),
    /// `{*rest}` 或 `*rest`，匹配剩余的零个或多个段
    CatchAll(String),
}

/// 匹配的具体程度，分数越高越优先
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MatchScore {
    /// 静态段数量
    pub exact_parts: usize,
    /// 不含通配段时为1
    pub bounded: usize,
    /// 模式总段数
    pub total_parts: usize,
}

/// 编译后的路由路径
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl PathPattern {
    pub fn parse(pattern: &str) -> Result<Self, Error> {
        let mut segments = Vec::new();
        let parts: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();

        for (i, part) in parts.iter().enumerate() {
            let segment = if let Some(name) = part
                .strip_prefix("{*")
                .and_then(|s| s.strip_suffix('}'))
                .or_else(|| part.strip_prefix('*'))
            {
                if i != parts.len() - 1 {
                    return Err(Error::InvalidConfig(format!(
                        "通配段只能位于路径末尾: {}",
                        pattern
                    )));
                }
                Segment::CatchAll(name.to_string())
            } else if let Some(name) = part
                .strip_prefix('{')
                .and_then(|s| s.strip_suffix('}'))
                .or_else(|| part.strip_prefix(':'))
            {
                if name.is_empty() {
                    return Err(Error::InvalidConfig(format!("路径参数缺少名称: {}", pattern)));
                }
                Segment::Param(name.to_string())
            } else if part.contains('{') || part.contains('}') {
                return Err(Error::InvalidConfig(format!("无法解析的路径: {}", pattern)));
            } else {
                Segment::Static(part.to_string())
            };
            segments.push(segment);
        }

        Ok(Self {
            raw: pattern.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// 匹配相对路径，成功时返回得分和路径参数
    pub fn matches(&self, path: &str) -> Option<(MatchScore, Vec<(String, String)>)> {
        let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let mut params = Vec::new();
        let mut exact_parts = 0;
        let mut bounded = 1;

        for (i, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::Static(expected) => {
                    if parts.get(i) != Some(&expected.as_str()) {
                        return None;
                    }
                    exact_parts += 1;
                }
                Segment::Param(name) => {
                    let value = parts.get(i)?;
                    params.push((name.clone(), (*value).to_string()));
                }
                Segment::CatchAll(name) => {
                    let rest = parts.get(i..).map(|p| p.join("/")).unwrap_or_default();
                    params.push((name.clone(), rest));
                    bounded = 0;
                    return Some((
                        MatchScore {
                            exact_parts,
                            bounded,
                            total_parts: self.segments.len(),
                        },
                        params,
                    ));
                }
            }
        }

        if parts.len() != self.segments.len() {
            return None;
        }

        Some((
            MatchScore {
                exact_parts,
                bounded,
                total_parts: self.segments.len(),
            },
            params,
        ))
    }
}
