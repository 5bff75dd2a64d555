use async_trait::async_trait;
use clap::Parser;
use reqwest_middleware::ClientBuilder;
use tokenlink::{
    hooks::{graphql_body, HookError, InMemoryTokenStore, RefreshResponse},
    AuthorizationError, RefreshBodySource, RefreshCompletion, SameOrigin, TokenLink,
};
use tokenlink_tokens::{clock::DurationSecs, AccessToken, CredentialPair, RefreshToken};

const REFRESH_MUTATION: &str = r#"
mutation RefreshSession($refreshToken: String!) {
  refreshSession(refreshToken: $refreshToken) {
    accessToken
    refreshToken
  }
}"#;

#[derive(Debug, Parser)]
struct Opts {
    /// The GraphQL endpoint that exchanges a refresh token for new tokens
    #[arg(short = 'u', long, env)]
    api_url: String,

    /// The API endpoint to call with the access token
    #[arg(short, long, env)]
    target_url: reqwest::Url,

    /// The initial access token
    #[arg(short, long, env, hide_env_values = true)]
    access_token: Option<String>,

    /// The initial refresh token
    #[arg(short, long, env, hide_env_values = true)]
    refresh_token: String,

    /// Refresh access tokens this many seconds before they expire
    #[arg(long, env, default_value_t = 30)]
    expiry_skew: u64,

    /// Trace every decision the link makes
    #[arg(long, env)]
    debug_mode: bool,
}

struct Session {
    store: InMemoryTokenStore,
}

#[async_trait]
impl RefreshBodySource for Session {
    async fn fetch_body(&self, current: &CredentialPair) -> Result<serde_json::Value, HookError> {
        let refresh_token = current
            .refresh_token()
            .ok_or("no refresh token is available")?;

        Ok(graphql_body(
            REFRESH_MUTATION,
            serde_json::json!({ "refreshToken": refresh_token.as_str() }),
        ))
    }
}

#[async_trait]
impl RefreshCompletion for Session {
    async fn on_refresh_complete(
        &self,
        response: RefreshResponse,
    ) -> Result<Option<CredentialPair>, HookError> {
        let body: serde_json::Value = response.json()?;
        let session = &body["data"]["refreshSession"];

        match (
            session["accessToken"].as_str(),
            session["refreshToken"].as_str(),
        ) {
            (Some(access), Some(refresh)) => {
                let pair = CredentialPair::new(
                    AccessToken::new(access.to_owned()),
                    RefreshToken::new(refresh.to_owned()),
                );
                self.store.replace(pair.clone()).await;
                tracing::info!("stored refreshed session");
                Ok(Some(pair))
            }
            _ => {
                tracing::warn!(
                    response.status = response.status().as_u16(),
                    errors = %body["errors"],
                    "refresh rejected, signing out"
                );
                self.store.replace(CredentialPair::empty()).await;
                Ok(None)
            }
        }
    }
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;

    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();

    let store = InMemoryTokenStore::new(CredentialPair::from_parts(
        opts.access_token.map(AccessToken::new),
        Some(RefreshToken::new(opts.refresh_token)),
    ));

    let link = TokenLink::builder()
        .api_url(opts.api_url)
        .token_store(store.clone())
        .body_source(Session {
            store: store.clone(),
        })
        .on_refresh_complete(Session {
            store: store.clone(),
        })
        .expiry_skew(DurationSecs(opts.expiry_skew))
        .debug_mode(opts.debug_mode)
        .predicate(SameOrigin::new(&opts.target_url))
        .build()?;

    let client = ClientBuilder::new(reqwest::Client::new())
        .with(link)
        .build();

    match client.get(opts.target_url).send().await {
        Ok(resp) => {
            tracing::info!(status = resp.status().as_u16(), "request completed");
            println!("{}", resp.text().await?);
        }
        Err(err) => match AuthorizationError::find(&err) {
            Some(auth) => {
                tracing::error!(error = %auth, "not signed in; please log in again");
            }
            None => return Err(err.into()),
        },
    }

    Ok(())
}
