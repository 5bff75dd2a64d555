//! Link construction and validation

use std::{collections::BTreeMap, fmt, sync::Arc};

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use serde::Deserialize;
use tokenlink_tokens::{
    clock::{Clock, DurationSecs, System},
    ExpiryEvaluator,
};

use crate::{
    coordinator::RefreshCoordinator,
    diagnostics::Diagnostics,
    error::ConfigurationError,
    hooks::{RefreshBodySource, RefreshCompletion, TokenStore},
    AnyRequest, TokenLink,
};

/// Plain-data link options, suitable for loading from a configuration file
///
/// Hooks cannot be expressed as data, so these are applied to a
/// [`TokenLinkBuilder`] with [`with_options()`][TokenLinkBuilder::with_options()].
///
/// ```
/// # use tokenlink::LinkOptions;
/// let options: LinkOptions = serde_json::from_str(r#"{
///     "apiUrl": "https://auth.example.com/graphql",
///     "debugMode": true,
///     "expirySkewSecs": 30
/// }"#).unwrap();
///
/// assert_eq!(options.debug_mode, Some(true));
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LinkOptions {
    /// The refresh endpoint
    pub api_url: Option<String>,
    /// Headers sent with the refresh request, replacing the defaults
    pub fetch_headers: Option<BTreeMap<String, String>>,
    /// Whether to emit decision tracing
    pub debug_mode: Option<bool>,
    /// How many seconds before expiry a token is treated as expired
    pub expiry_skew_secs: Option<u64>,
}

/// Builder for a [`TokenLink`]
///
/// `api_url`, `token_store`, `body_source`, and `on_refresh_complete` are
/// required. [`build()`][Self::build()] checks for them immediately, so a
/// misconfigured link fails at start-up rather than on its first request.
pub struct TokenLinkBuilder<C = System, P = AnyRequest> {
    api_url: Option<String>,
    token_store: Option<Arc<dyn TokenStore>>,
    body_source: Option<Arc<dyn RefreshBodySource>>,
    completion: Option<Arc<dyn RefreshCompletion>>,
    fetch_headers: Vec<(String, String)>,
    debug_mode: bool,
    expiry_skew: DurationSecs,
    client: Option<reqwest::Client>,
    clock: C,
    predicate: P,
}

impl<C: fmt::Debug, P: fmt::Debug> fmt::Debug for TokenLinkBuilder<C, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenLinkBuilder")
            .field("api_url", &self.api_url)
            .field("token_store", &self.token_store.is_some())
            .field("body_source", &self.body_source.is_some())
            .field("completion", &self.completion.is_some())
            .field("fetch_headers", &self.fetch_headers)
            .field("debug_mode", &self.debug_mode)
            .field("expiry_skew", &self.expiry_skew)
            .field("clock", &self.clock)
            .field("predicate", &self.predicate)
            .finish()
    }
}

impl Default for TokenLinkBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenLinkBuilder {
    /// Constructs a builder with default options and no collaborators
    ///
    /// Refresh requests are sent with `Content-Type: application/json`
    /// unless other headers are configured, and decision tracing is off.
    pub fn new() -> Self {
        Self {
            api_url: None,
            token_store: None,
            body_source: None,
            completion: None,
            fetch_headers: vec![(CONTENT_TYPE.as_str().to_owned(), "application/json".to_owned())],
            debug_mode: false,
            expiry_skew: DurationSecs(0),
            client: None,
            clock: System,
            predicate: AnyRequest,
        }
    }
}

impl<C, P> TokenLinkBuilder<C, P> {
    /// Sets the refresh endpoint
    pub fn api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = Some(api_url.into());
        self
    }

    /// Sets the source of the current tokens
    pub fn token_store(mut self, store: impl TokenStore + 'static) -> Self {
        self.token_store = Some(Arc::new(store));
        self
    }

    /// Sets the producer of refresh request bodies
    pub fn body_source(mut self, source: impl RefreshBodySource + 'static) -> Self {
        self.body_source = Some(Arc::new(source));
        self
    }

    /// Sets the interpreter of refresh responses
    pub fn on_refresh_complete(mut self, completion: impl RefreshCompletion + 'static) -> Self {
        self.completion = Some(Arc::new(completion));
        self
    }

    /// Uses a single value for all three hooks
    pub fn hooks<H>(mut self, hooks: H) -> Self
    where
        H: TokenStore + RefreshBodySource + RefreshCompletion + 'static,
    {
        let hooks = Arc::new(hooks);
        self.token_store = Some(hooks.clone());
        self.body_source = Some(hooks.clone());
        self.completion = Some(hooks);
        self
    }

    /// Replaces the headers sent with the refresh request
    pub fn fetch_headers<I, K, V>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.fetch_headers = headers
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self
    }

    /// Adds a header to those sent with the refresh request
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fetch_headers.push((name.into(), value.into()));
        self
    }

    /// Enables or disables decision tracing
    pub fn debug_mode(mut self, enabled: bool) -> Self {
        self.debug_mode = enabled;
        self
    }

    /// Treats access tokens as expired `skew` before their actual expiry
    pub fn expiry_skew(mut self, skew: DurationSecs) -> Self {
        self.expiry_skew = skew;
        self
    }

    /// Sets the HTTP client used for refresh requests
    ///
    /// This client should not itself carry the link, or every refresh
    /// request would try to authorize itself.
    pub fn client(mut self, client: reqwest::Client) -> Self {
        self.client = Some(client);
        self
    }

    /// Applies plain-data options on top of the current configuration
    pub fn with_options(mut self, options: LinkOptions) -> Self {
        if let Some(api_url) = options.api_url {
            self.api_url = Some(api_url);
        }
        if let Some(headers) = options.fetch_headers {
            self.fetch_headers = headers.into_iter().collect();
        }
        if let Some(debug_mode) = options.debug_mode {
            self.debug_mode = debug_mode;
        }
        if let Some(skew) = options.expiry_skew_secs {
            self.expiry_skew = DurationSecs(skew);
        }
        self
    }

    /// Sets a custom clock to be used
    ///
    /// Useful for testing purposes
    pub fn clock<D>(self, clock: D) -> TokenLinkBuilder<D, P> {
        TokenLinkBuilder {
            api_url: self.api_url,
            token_store: self.token_store,
            body_source: self.body_source,
            completion: self.completion,
            fetch_headers: self.fetch_headers,
            debug_mode: self.debug_mode,
            expiry_skew: self.expiry_skew,
            client: self.client,
            clock,
            predicate: self.predicate,
        }
    }

    /// Restricts the link to requests matching `predicate`
    ///
    /// Other requests are forwarded without a token. See
    /// [`TokenLink::with_predicate()`].
    pub fn predicate<Q>(self, predicate: Q) -> TokenLinkBuilder<C, Q> {
        TokenLinkBuilder {
            api_url: self.api_url,
            token_store: self.token_store,
            body_source: self.body_source,
            completion: self.completion,
            fetch_headers: self.fetch_headers,
            debug_mode: self.debug_mode,
            expiry_skew: self.expiry_skew,
            client: self.client,
            clock: self.clock,
            predicate,
        }
    }
}

impl<C: Clock, P> TokenLinkBuilder<C, P> {
    /// Validates the configuration and constructs the link
    ///
    /// # Errors
    ///
    /// Returns an error naming the first missing required option, in the
    /// order `api_url`, `get_tokens`, `fetch_body`, `on_refresh_complete`,
    /// or describing an invalid URL or refresh header.
    pub fn build(self) -> Result<TokenLink<C, P>, ConfigurationError> {
        let api_url = self
            .api_url
            .ok_or(ConfigurationError::Missing("api_url"))?;
        let token_store = self
            .token_store
            .ok_or(ConfigurationError::Missing("get_tokens"))?;
        let body_source = self
            .body_source
            .ok_or(ConfigurationError::Missing("fetch_body"))?;
        let completion = self
            .completion
            .ok_or(ConfigurationError::Missing("on_refresh_complete"))?;

        let api_url = reqwest::Url::parse(&api_url)?;
        let headers = header_map(self.fetch_headers)?;
        let diagnostics = Diagnostics::new(self.debug_mode);

        let coordinator = RefreshCoordinator::new(
            self.client.unwrap_or_default(),
            api_url,
            headers,
            body_source,
            completion,
            diagnostics,
        );

        let evaluator = ExpiryEvaluator::new()
            .with_skew(self.expiry_skew)
            .with_clock(self.clock);

        Ok(TokenLink::from_parts(
            token_store,
            evaluator,
            coordinator,
            diagnostics,
            self.predicate,
        ))
    }
}

fn header_map(headers: Vec<(String, String)>) -> Result<HeaderMap, ConfigurationError> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let invalid = || ConfigurationError::InvalidHeader { name: name.clone() };
        let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| invalid())?;
        let header_value = HeaderValue::from_str(&value).map_err(|_| invalid())?;
        map.insert(header_name, header_value);
    }
    Ok(map)
}
