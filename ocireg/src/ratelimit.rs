use reqwest::header::HeaderMap;

/// Rate limit policy extracted from `RateLimit-*` response headers, most
/// prominently sent by Docker Hub on manifest requests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimit {
    /// True when any ratelimit header was present on the response.
    pub set: bool,
    pub limit: Option<u64>,
    pub remaining: Option<u64>,
    pub reset: Option<u64>,
    /// Raw policy descriptors that followed the numeric value, e.g. `w=21600`.
    pub policies: Vec<String>,
}

impl RateLimit {
    pub fn from_headers(headers: &HeaderMap) -> RateLimit {
        let mut rl = RateLimit::default();
        let mut policies = Vec::new();
        if let Some((v, p)) = parse_field(headers, "ratelimit-limit") {
            rl.limit = Some(v);
            rl.set = true;
            policies.extend(p);
        }
        if let Some((v, p)) = parse_field(headers, "ratelimit-remaining") {
            rl.remaining = Some(v);
            rl.set = true;
            policies.extend(p);
        }
        if let Some((v, p)) = parse_field(headers, "ratelimit-reset") {
            rl.reset = Some(v);
            rl.set = true;
            policies.extend(p);
        }
        rl.policies = policies;
        rl
    }
}

// "100;w=21600" or "100, 200;w=3600": the first numeric token before ; or ,
// is the value, everything after are policy descriptors
fn parse_field(headers: &HeaderMap, name: &str) -> Option<(u64, Vec<String>)> {
    let raw = headers.get(name)?.to_str().ok()?;
    parse_value(raw)
}

fn parse_value(raw: &str) -> Option<(u64, Vec<String>)> {
    let end = raw
        .find(|c| c == ';' || c == ',')
        .unwrap_or(raw.len());
    let value = raw[..end].trim().parse().ok()?;
    let policies = raw[end..]
        .split([';', ','])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    Some((value, policies))
}
