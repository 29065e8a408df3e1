use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use moka::{Expiry, future::Cache};
use reqwest::header::{HeaderMap, HeaderValue, WWW_AUTHENTICATE};
use serde::Deserialize;

use crate::errors::{Error, Result};

// https://distribution.github.io/distribution/spec/auth/token/#token-response-fields
// gives the default expiry as 60 seconds
const DEFAULT_TOKEN_EXPIRY: u64 = 60;

/// A parsed `WWW-Authenticate` challenge: scheme plus its parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub scheme: String,
    pub params: BTreeMap<String, String>,
}

pub fn parse_www_authenticate(input: &HeaderValue) -> Option<Challenge> {
    parse_www_authenticate_str(input.to_str().ok()?)
}

fn parse_www_authenticate_str(input: &str) -> Option<Challenge> {
    use nom::{
        IResult, Parser,
        branch::alt,
        bytes::{complete::tag, complete::take_while1, take_until1},
        character::complete::{alpha1, char},
        multi::{many0, many1, separated_list0},
        sequence::{delimited, separated_pair, terminated},
    };
    fn parser(input: &str) -> IResult<&str, (&str, Vec<(&str, &str)>)> {
        let (input, scheme) = alpha1(input)?;
        let (input, _) = many1(tag(" ")).parse(input)?;
        let (input, params) = separated_list0(
            terminated(tag(","), many0(tag(" "))),
            separated_pair(
                alpha1,
                tag("="),
                alt((
                    delimited(char('"'), take_until1("\""), char('"')),
                    take_while1(|c: char| c != ',' && c != ' ' && c != '"'),
                )),
            ),
        )
        .parse(input)?;
        Ok((input, (scheme, params)))
    }
    let (_, (scheme, params)) = parser(input).ok()?;
    Some(Challenge {
        scheme: scheme.to_ascii_lowercase(),
        params: params
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    })
}

/// Static credentials for one host; the empty host name holds the default
/// set used when a host has none of its own.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub user: String,
    pub pass: String,
    pub token: String,
}

impl Credentials {
    pub fn is_empty(&self) -> bool {
        self.user.is_empty() && self.token.is_empty()
    }
}

#[derive(PartialEq, Eq, Hash, Debug)]
struct TokenKey {
    host: String,
    scope: String,
}

#[derive(Clone)]
struct Token {
    token: String,
    expires_in: Duration,
}

#[derive(Default)]
struct ExpireToken;

impl Expiry<TokenKey, Token> for ExpireToken {
    fn expire_after_create(
        &self,
        _key: &TokenKey,
        value: &Token,
        _current_time: Instant,
    ) -> Option<Duration> {
        trace!("{_key:?} expires in {:?}", value.expires_in);
        Some(value.expires_in)
    }
}

/// Negotiates and caches registry credentials. Bearer tokens are cached per
/// host+scope; acquisition for one key is serialized so concurrent 401s
/// lead to a single token-endpoint round trip.
#[derive(Clone)]
pub struct Auther {
    http: reqwest::Client,
    tokens: Cache<TokenKey, Token>,
}

impl Auther {
    pub fn new(http: reqwest::Client) -> Auther {
        let tokens = Cache::builder()
            .max_capacity(10_000_000)
            .weigher(|k: &TokenKey, v: &Token| {
                (k.host.len() + k.scope.len() + v.token.len())
                    .try_into()
                    .unwrap_or(u32::MAX)
            })
            .expire_after(ExpireToken)
            .build();
        Auther { http, tokens }
    }

    /// Add `Authorization` to a request: cached bearer token first, then a
    /// static host token, then basic auth.
    pub async fn stamp(
        &self,
        req: reqwest::RequestBuilder,
        host: &str,
        creds: &Credentials,
        scope: &str,
    ) -> reqwest::RequestBuilder {
        let key = TokenKey {
            host: host.to_string(),
            scope: scope.to_string(),
        };
        if let Some(token) = self.tokens.get(&key).await {
            return req.bearer_auth(token.token);
        }
        if !creds.token.is_empty() {
            return req.bearer_auth(&creds.token);
        }
        if !creds.user.is_empty() {
            return req.basic_auth(&creds.user, Some(&creds.pass));
        }
        req
    }

    /// React to a 401: parse the challenge and, for bearer, fetch a fresh
    /// token into the cache. Ok means the caller should retry the request.
    pub async fn handle_challenge(
        &self,
        host: &str,
        creds: &Credentials,
        scope: &str,
        headers: &HeaderMap,
    ) -> Result<()> {
        let challenge = headers
            .get(WWW_AUTHENTICATE)
            .and_then(parse_www_authenticate)
            .ok_or_else(|| {
                Error::Unauthorized(format!("{}: no parseable www-authenticate challenge", host))
            })?;
        match challenge.scheme.as_str() {
            "basic" => {
                // nothing to acquire; stamp() will send the static creds
                if creds.user.is_empty() {
                    Err(Error::Unauthorized(format!(
                        "{}: basic auth requested but no credentials configured",
                        host
                    )))
                } else {
                    Ok(())
                }
            }
            "bearer" => {
                let realm = challenge.params.get("realm").ok_or_else(|| {
                    Error::Unauthorized(format!("{}: bearer challenge without realm", host))
                })?;
                let service = challenge.params.get("service").cloned().unwrap_or_default();
                let scope = challenge
                    .params
                    .get("scope")
                    .cloned()
                    .unwrap_or_else(|| scope.to_string());
                self.refresh_token(host, creds, realm, &service, &scope)
                    .await
            }
            other => Err(Error::Unauthorized(format!(
                "{}: unsupported auth scheme {:?}",
                host, other
            ))),
        }
    }

    async fn refresh_token(
        &self,
        host: &str,
        creds: &Credentials,
        realm: &str,
        service: &str,
        scope: &str,
    ) -> Result<()> {
        let key = TokenKey {
            host: host.to_string(),
            scope: scope.to_string(),
        };
        // drop the stale entry, then let moka coalesce concurrent fetches
        self.tokens.invalidate(&key).await;
        let entry = self
            .tokens
            .entry(key)
            .or_try_insert_with(fetch_token(
                self.http.clone(),
                host,
                creds,
                realm,
                service,
                scope,
            ))
            .await
            .map_err(|e| Error::Unauthorized(format!("{}: token fetch failed: {}", host, e)))?;
        if entry.is_fresh() {
            debug!("new token for {} scope {:?}", host, entry.key().scope);
        }
        Ok(())
    }
}

async fn fetch_token(
    http: reqwest::Client,
    host: &str,
    creds: &Credentials,
    realm: &str,
    service: &str,
    scope: &str,
) -> Result<Token> {
    #[derive(Deserialize)]
    struct JsonToken {
        #[serde(default)]
        token: String,
        #[serde(default)]
        access_token: String,
        expires_in: Option<u64>,
    }

    // a challenge scope can carry several space-separated scopes; the token
    // endpoint wants each as its own query value
    let mut query: Vec<(&str, &str)> = scope
        .split_whitespace()
        .map(|s| ("scope", s))
        .collect();
    if !service.is_empty() {
        query.push(("service", service));
    }

    let mut req = http.get(realm).query(&query);
    if !creds.user.is_empty() {
        req = req.basic_auth(&creds.user, Some(&creds.pass));
    }
    trace!("token request to {} for {}", realm, host);
    let res = req.send().await?;
    if !res.status().is_success() {
        return Err(Error::Unauthorized(format!(
            "{}: token endpoint returned {}",
            host,
            res.status()
        )));
    }
    let body: JsonToken = res.json().await?;
    let token = if !body.token.is_empty() {
        body.token
    } else if !body.access_token.is_empty() {
        body.access_token
    } else {
        warn!("token endpoint {} returned no token for {}", realm, host);
        return Err(Error::Unauthorized(format!(
            "{}: token response carried no token",
            host
        )));
    };
    let expires_in = Duration::from_secs(body.expires_in.unwrap_or(DEFAULT_TOKEN_EXPIRY));
    Ok(Token { token, expires_in })
}
