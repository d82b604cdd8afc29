use std::collections::HashMap;
use std::io::Read;

use flate2::read::GzDecoder;
use tracing::{debug, error, warn};

use common::error::Error;

/// 逐跳请求头，不转发
pub const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS.contains(&name)
}

/// 合并URL
pub fn join_url(base: &str, path: &str) -> String {
    let base_ends_with_slash = base.ends_with('/');
    let path_starts_with_slash = path.starts_with('/');

    match (base_ends_with_slash, path_starts_with_slash) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) if !path.is_empty() => format!("{}/{}", base, path),
        _ => format!("{}{}", base, path),
    }
}

/// 在原查询串后追加路由配置的查询参数，同名参数以配置为准
pub fn merge_query(query: Option<&str>, extra: &HashMap<String, String>) -> Option<String> {
    let mut pairs: Vec<String> = query
        .unwrap_or_default()
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter(|pair| {
            let key = pair.split_once('=').map_or(*pair, |(k, _)| k);
            !extra.contains_key(key)
        })
        .map(str::to_string)
        .collect();

    let mut extra: Vec<_> = extra.iter().collect();
    extra.sort();
    pairs.extend(extra.into_iter().map(|(k, v)| format!("{}={}", k, v)));

    (!pairs.is_empty()).then(|| pairs.join("&"))
}

/// 解析查询串为键值对
pub fn query_pairs(query: Option<&str>) -> Vec<(String, String)> {
    query
        .unwrap_or_default()
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}

/// 处理请求体，GZIP压缩时自动解压
///
/// 返回处理后的请求体以及是否做过解压。解压后超过 `max_size` 字节时拒绝。
pub fn process_request_body(
    body: &[u8],
    content_type: Option<&str>,
    content_encoding: Option<&str>,
    max_size: usize,
) -> Result<(Vec<u8>, bool), Error> {
    if body.is_empty() {
        return Ok((Vec::new(), false));
    }

    let is_gzipped = content_encoding.is_some_and(|e| e.to_lowercase().contains("gzip"));
    if !is_gzipped {
        return Ok((body.to_vec(), false));
    }

    debug!("检测到GZIP压缩的请求体，开始解压");
    // 多读一个字节用于判断是否超限
    let mut decoder = GzDecoder::new(body).take(max_size as u64 + 1);
    let mut decompressed = Vec::new();
    decoder.read_to_end(&mut decompressed).map_err(|e| {
        error!("GZIP解压失败: {}", e);
        Error::BadRequest(format!("GZIP解压失败: {}", e))
    })?;
    if decompressed.len() > max_size {
        warn!("解压后的请求体超过上限: {} 字节", max_size);
        return Err(Error::PayloadTooLarge(format!("解压后超过 {} 字节", max_size)));
    }

    // JSON请求体解压后校验一次
    let is_json = content_type.is_some_and(|t| t.to_lowercase().contains("json"));
    if is_json {
        serde_json::from_slice::<serde_json::Value>(&decompressed).map_err(|e| {
            error!("解压后的数据不是有效的JSON: {}", e);
            Error::BadRequest(format!("解压后的数据不是有效的JSON: {}", e))
        })?;
    }

    debug!("成功解压请求体: {} 字节 -> {} 字节", body.len(), decompressed.len());
    Ok((decompressed, true))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    const LIMIT: usize = 1024 * 1024;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_join_url() {
        assert_eq!(join_url("http://a:80/", "/x"), "http://a:80/x");
        assert_eq!(join_url("http://a:80", "x"), "http://a:80/x");
        assert_eq!(join_url("http://a:80/base", "/x"), "http://a:80/base/x");
        assert_eq!(join_url("http://a:80", ""), "http://a:80");
    }

    #[test]
    fn test_merge_query() {
        let mut extra = HashMap::new();
        extra.insert("version".to_string(), "2".to_string());
        assert_eq!(
            merge_query(Some("page=1&version=1"), &extra).as_deref(),
            Some("page=1&version=2")
        );
        assert_eq!(merge_query(None, &HashMap::new()), None);
        assert_eq!(merge_query(Some("a=1"), &HashMap::new()).as_deref(), Some("a=1"));
    }

    #[test]
    fn test_query_pairs() {
        assert_eq!(
            query_pairs(Some("a=1&flag&b=")),
            vec![
                ("a".to_string(), "1".to_string()),
                ("flag".to_string(), String::new()),
                ("b".to_string(), String::new()),
            ]
        );
        assert!(query_pairs(None).is_empty());
    }

    #[test]
    fn test_process_request_body_not_gzipped() {
        let data = b"{ \"hello\": \"world\" }";
        let (body, decompressed) = process_request_body(data, Some("application/json"), None, LIMIT).unwrap();
        assert_eq!(body, data);
        assert!(!decompressed);
    }

    #[test]
    fn test_process_request_body_gzipped_json() {
        let json_data = b"{ \"hello\": \"world\" }";
        let (body, decompressed) =
            process_request_body(&gzip(json_data), Some("application/json"), Some("gzip"), LIMIT).unwrap();
        assert_eq!(body, json_data);
        assert!(decompressed);
    }

    #[test]
    fn test_process_request_body_invalid_json() {
        let result = process_request_body(&gzip(b"not json"), Some("application/json"), Some("gzip"), LIMIT);
        assert!(matches!(result, Err(Error::BadRequest(_))));
        assert!(process_request_body(b"garbage", None, Some("gzip"), LIMIT).is_err());
    }

    #[test]
    fn test_process_request_body_rejects_gzip_bomb() {
        // 压缩后很小，解压后远超上限
        let bomb = gzip(&vec![b'0'; 16 * 1024 * 1024]);
        assert!(bomb.len() < LIMIT);
        let result = process_request_body(&bomb, Some("application/json"), Some("gzip"), LIMIT);
        assert!(matches!(result, Err(Error::PayloadTooLarge(_))));

        // 恰好等于上限时放行
        let exact = gzip(&vec![b' '; LIMIT]);
        let (body, _) = process_request_body(&exact, None, Some("gzip"), LIMIT).unwrap();
        assert_eq!(body.len(), LIMIT);
    }
}
