//! Remote tree access over the GitHub REST API.

use std::time::Duration;

use {
    async_trait::async_trait,
    reqwest::{Response, StatusCode},
    secrecy::{ExposeSecret, Secret},
    serde::Deserialize,
    tokio_util::sync::CancellationToken,
    tracing::{debug, trace},
    url::Url,
};

use crate::{
    error::{Error, ErrorKind, Result},
    retry::{self, RetryPolicy},
    source::SourceRef,
    types::RemoteEntry,
};

pub const DEFAULT_API_BASE_URL: &str = "https://api.github.com";

const USER_AGENT: &str = concat!("gskills-cli/", env!("CARGO_PKG_VERSION"));
const GITHUB_JSON: &str = "application/vnd.github+json";

/// Read access to a remote repository tree.
///
/// Every call retries rate-limit responses internally and observes `cancel`
/// before issuing a request and while backing off.
#[async_trait]
pub trait RemoteTreeClient: Send + Sync {
    /// Direct children of `path` (repository-relative) at the source's branch.
    async fn list_children(
        &self,
        source: &SourceRef,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<RemoteEntry>>;

    /// Raw bytes behind a download locator returned by [`Self::list_children`].
    async fn fetch_raw(&self, locator: &str, cancel: &CancellationToken) -> Result<Vec<u8>>;

    /// Current head commit of the source's branch.
    async fn latest_revision(&self, source: &SourceRef, cancel: &CancellationToken)
    -> Result<String>;

    async fn path_exists(
        &self,
        source: &SourceRef,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<bool>;
}

/// Connection settings for [`GithubClient`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub api_base_url: String,
    pub token: Option<Secret<String>>,
    pub proxy: Option<String>,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            token: None,
            proxy: None,
            timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

pub struct GithubClient {
    http: reqwest::Client,
    base_url: String,
    api_host: Option<String>,
    token: Option<Secret<String>>,
    retry: RetryPolicy,
}

#[derive(Deserialize)]
struct CommitResponse {
    #[serde(default)]
    sha: Option<String>,
}

impl GithubClient {
    pub fn new(options: ClientOptions) -> Result<Self> {
        let base = Url::parse(&options.api_base_url).map_err(|e| {
            Error::invalid_input(format!("invalid API base URL '{}': {e}", options.api_base_url))
        })?;

        let mut builder = reqwest::Client::builder()
            .timeout(options.timeout)
            .user_agent(USER_AGENT);
        if let Some(proxy) = options.proxy.as_deref().filter(|p| !p.trim().is_empty()) {
            let proxy = reqwest::Proxy::all(proxy)
                .map_err(|e| Error::invalid_input(format!("invalid proxy '{proxy}': {e}")))?;
            builder = builder.proxy(proxy);
        }
        let http = builder.build().map_err(|source| Error::Transport {
            url: options.api_base_url.clone(),
            source,
        })?;

        Ok(Self {
            http,
            base_url: options.api_base_url.trim_end_matches('/').to_string(),
            api_host: base.host_str().map(str::to_string),
            token: options.token,
            retry: options.retry,
        })
    }

    fn contents_url(&self, source: &SourceRef, path: &str) -> Result<Url> {
        let raw = format!(
            "{}/repos/{}/{}/contents/{}",
            self.base_url,
            source.owner,
            source.repo,
            path.trim_matches('/')
        );
        Url::parse_with_params(&raw, &[("ref", source.branch.as_str())])
            .map_err(|e| Error::invalid_input(format!("invalid contents URL '{raw}': {e}")))
    }

    fn commit_url(&self, source: &SourceRef) -> String {
        format!(
            "{}/repos/{}/{}/commits/{}",
            self.base_url, source.owner, source.repo, source.branch
        )
    }

    /// The token only goes to the API host and GitHub's own download hosts.
    fn authorizes(&self, url: &Url) -> bool {
        match url.host_str() {
            Some(host) => {
                self.api_host.as_deref() == Some(host)
                    || host == "github.com"
                    || host.ends_with(".github.com")
                    || host.ends_with(".githubusercontent.com")
            },
            None => false,
        }
    }

    fn request(&self, url: &Url, accept: Option<&str>) -> reqwest::RequestBuilder {
        let mut req = self.http.get(url.clone());
        if let Some(accept) = accept {
            req = req.header(reqwest::header::ACCEPT, accept);
        }
        if let Some(token) = &self.token
            && self.authorizes(url)
        {
            req = req.bearer_auth(token.expose_secret());
        }
        req
    }

    /// One GET with rate-limit retry. Non-success statuses become errors.
    async fn get(
        &self,
        url: &Url,
        accept: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Response> {
        let target = url.as_str();
        retry::with_backoff(&self.retry, cancel, target, || async {
            trace!(url = target, "GET");
            let sent = self.request(url, accept).send().await;
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let resp = sent.map_err(|source| classify_transport(target, source))?;
            check_status(target, resp)
        })
        .await
    }
}

fn classify_transport(url: &str, source: reqwest::Error) -> Error {
    if is_rate_limit_message(&source.to_string()) {
        Error::RateLimited {
            url: url.to_string(),
            attempts: 1,
        }
    } else {
        Error::Transport {
            url: url.to_string(),
            source,
        }
    }
}

fn is_rate_limit_message(message: &str) -> bool {
    message.to_ascii_lowercase().contains("rate limit exceeded")
}

fn check_status(url: &str, resp: Response) -> Result<Response> {
    let status = resp.status();
    match status {
        s if s.is_success() => Ok(resp),
        StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS => {
            debug!(url, status = status.as_u16(), "rate limit response");
            Err(Error::RateLimited {
                url: url.to_string(),
                attempts: 1,
            })
        },
        StatusCode::NOT_FOUND => Err(Error::not_found(format!("remote path {url}"))),
        _ => Err(Error::Http {
            url: url.to_string(),
            status: status.as_u16(),
        }),
    }
}

#[async_trait]
impl RemoteTreeClient for GithubClient {
    async fn list_children(
        &self,
        source: &SourceRef,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<RemoteEntry>> {
        let url = self.contents_url(source, path)?;
        let resp = self.get(&url, Some(GITHUB_JSON), cancel).await?;
        let body = resp.text().await.map_err(|source| Error::Transport {
            url: url.to_string(),
            source,
        })?;
        serde_json::from_str::<Vec<RemoteEntry>>(&body)
            .map_err(|e| Error::parse(format!("directory listing of '{path}'"), e))
    }

    async fn fetch_raw(&self, locator: &str, cancel: &CancellationToken) -> Result<Vec<u8>> {
        let url = Url::parse(locator)
            .map_err(|e| Error::invalid_input(format!("invalid download URL '{locator}': {e}")))?;
        let resp = self.get(&url, None, cancel).await?;
        let bytes = resp.bytes().await.map_err(|source| Error::Transport {
            url: locator.to_string(),
            source,
        })?;
        Ok(bytes.to_vec())
    }

    async fn latest_revision(
        &self,
        source: &SourceRef,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let raw = self.commit_url(source);
        let url = Url::parse(&raw)
            .map_err(|e| Error::invalid_input(format!("invalid commit URL '{raw}': {e}")))?;
        let resp = self.get(&url, Some(GITHUB_JSON), cancel).await?;
        let body = resp.text().await.map_err(|source| Error::Transport {
            url: raw.clone(),
            source,
        })?;
        let commit: CommitResponse = serde_json::from_str(&body)
            .map_err(|e| Error::parse(format!("commit info for '{}'", source.branch), e))?;
        commit
            .sha
            .filter(|sha| !sha.is_empty())
            .ok_or_else(|| Error::parse(format!("commit info for '{}'", source.branch), "missing sha"))
    }

    async fn path_exists(
        &self,
        source: &SourceRef,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let url = self.contents_url(source, path)?;
        match self.get(&url, Some(GITHUB_JSON), cancel).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, mockito::Matcher};

    fn source() -> SourceRef {
        SourceRef::parse("https://github.com/o/r/tree/main/skills/demo").unwrap()
    }

    fn client(base: &str) -> GithubClient {
        GithubClient::new(ClientOptions {
            api_base_url: base.to_string(),
            token: Some(Secret::new("tok".to_string())),
            retry: RetryPolicy::new(5, Duration::ZERO),
            ..ClientOptions::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn lists_children_with_auth_and_ref() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/repos/o/r/contents/skills/demo")
            .match_query(Matcher::UrlEncoded("ref".into(), "main".into()))
            .match_header("authorization", "Bearer tok")
            .match_header("accept", GITHUB_JSON)
            .with_status(200)
            .with_body(
                r#"[
                    {"name":"SKILL.md","path":"skills/demo/SKILL.md","type":"file","size":5,"download_url":"https://raw.githubusercontent.com/o/r/main/skills/demo/SKILL.md"},
                    {"name":"lib","path":"skills/demo/lib","type":"dir","size":0,"download_url":null}
                ]"#,
            )
            .create_async()
            .await;

        let entries = client(&server.url())
            .list_children(&source(), "skills/demo", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "SKILL.md");
        assert_eq!(entries[1].kind, crate::types::EntryKind::Dir);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn rate_limit_is_retried_until_success() {
        let mut server = mockito::Server::new_async().await;
        let limited = server
            .mock("GET", "/raw/file.txt")
            .with_status(429)
            .expect(2)
            .create_async()
            .await;
        let ok = server
            .mock("GET", "/raw/file.txt")
            .with_status(200)
            .with_body("hello")
            .expect(1)
            .create_async()
            .await;

        let url = format!("{}/raw/file.txt", server.url());
        let bytes = client(&server.url())
            .fetch_raw(&url, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(bytes, b"hello");
        limited.assert_async().await;
        ok.assert_async().await;
    }

    #[tokio::test]
    async fn exhausted_rate_limit_surfaces_kind() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/repos/o/r/commits/main")
            .with_status(403)
            .expect(5)
            .create_async()
            .await;

        let err = client(&server.url())
            .latest_revision(&source(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RateLimited);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn not_found_is_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/repos/o/r/contents/skills/missing")
            .match_query(Matcher::Any)
            .with_status(404)
            .expect(1)
            .create_async()
            .await;

        let err = client(&server.url())
            .list_children(&source(), "skills/missing", &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn path_exists_maps_404_to_false() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/repos/o/r/contents/skills/demo/SKILL.md")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;
        server
            .mock("GET", "/repos/o/r/contents/skills/other/SKILL.md")
            .match_query(Matcher::Any)
            .with_status(404)
            .create_async()
            .await;

        let c = client(&server.url());
        let cancel = CancellationToken::new();
        assert!(
            c.path_exists(&source(), "skills/demo/SKILL.md", &cancel)
                .await
                .unwrap()
        );
        assert!(
            !c.path_exists(&source(), "skills/other/SKILL.md", &cancel)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn latest_revision_reads_sha() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/repos/o/r/commits/main")
            .with_status(200)
            .with_body(r#"{"sha":"abc123","commit":{}}"#)
            .create_async()
            .await;
        let sha = client(&server.url())
            .latest_revision(&source(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(sha, "abc123");
    }

    #[tokio::test]
    async fn missing_sha_is_parse_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/repos/o/r/commits/main")
            .with_status(200)
            .with_body(r#"{"commit":{}}"#)
            .create_async()
            .await;
        let err = client(&server.url())
            .latest_revision(&source(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Parse);
    }

    #[tokio::test]
    async fn malformed_listing_is_parse_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/repos/o/r/contents/skills/demo")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body("not json")
            .create_async()
            .await;
        let err = client(&server.url())
            .list_children(&source(), "skills/demo", &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Parse);
    }

    #[tokio::test]
    async fn server_error_maps_to_transport() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/repos/o/r/commits/main")
            .with_status(502)
            .create_async()
            .await;
        let err = client(&server.url())
            .latest_revision(&source(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Http { status: 502, .. }));
        assert_eq!(err.kind(), ErrorKind::Transport);
    }

    #[tokio::test]
    async fn cancelled_token_skips_request() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/repos/o/r/commits/main")
            .expect(0)
            .create_async()
            .await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = client(&server.url())
            .latest_revision(&source(), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        mock.assert_async().await;
    }

    #[test]
    fn token_is_not_sent_to_foreign_hosts() {
        let c = client("https://api.github.com");
        assert!(c.authorizes(&Url::parse("https://api.github.com/x").unwrap()));
        assert!(c.authorizes(&Url::parse("https://raw.githubusercontent.com/x").unwrap()));
        assert!(!c.authorizes(&Url::parse("https://example.com/x").unwrap()));
    }

    #[test]
    fn rate_limit_message_detection() {
        assert!(is_rate_limit_message("API rate limit exceeded for 1.2.3.4"));
        assert!(!is_rate_limit_message("connection reset"));
    }
}
