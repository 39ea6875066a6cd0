use oauth2::{
    basic::BasicClient, AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken,
    RedirectUrl, RefreshToken, Scope, TokenResponse, TokenUrl,
};

use crate::modules::credentials::entity::TokenSet;
use crate::modules::error::{code::ErrorCode, MailSiftResult};
use crate::modules::settings::cli::SETTINGS;
use crate::{raise_error, utc_now};

const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
pub const GOOGLE_USERINFO_URL: &str = "https://www.googleapis.com/oauth2/v2/userinfo";

pub const REQUESTED_SCOPES: [&str; 3] = [
    "https://www.googleapis.com/auth/gmail.readonly",
    "https://www.googleapis.com/auth/userinfo.email",
    "https://www.googleapis.com/auth/userinfo.profile",
];

pub type OAuth2Client = oauth2::Client<
    oauth2::StandardErrorResponse<oauth2::basic::BasicErrorResponseType>,
    oauth2::StandardTokenResponse<oauth2::EmptyExtraTokenFields, oauth2::basic::BasicTokenType>,
    oauth2::StandardTokenIntrospectionResponse<
        oauth2::EmptyExtraTokenFields,
        oauth2::basic::BasicTokenType,
    >,
    oauth2::StandardRevocableToken,
    oauth2::StandardErrorResponse<oauth2::RevocationErrorResponseType>,
    oauth2::EndpointSet,
    oauth2::EndpointNotSet,
    oauth2::EndpointNotSet,
    oauth2::EndpointNotSet,
    oauth2::EndpointSet,
>;

pub struct OAuthFlow;

impl OAuthFlow {
    /// The consent URL for connecting a Gmail account. `access_type=offline`
    /// and `prompt=consent` force the provider to issue a refresh token on
    /// reconnect.
    pub fn authorize_url() -> MailSiftResult<(String, String)> {
        let client = Self::build_client()?;
        let (authorize_url, csrf_state) = client
            .authorize_url(CsrfToken::new_random)
            .add_scopes(REQUESTED_SCOPES.iter().map(|s| Scope::new(s.to_string())))
            .add_extra_param("access_type", "offline")
            .add_extra_param("prompt", "consent")
            .url();
        Ok((authorize_url.to_string(), csrf_state.secret().to_owned()))
    }

    /// Consumes the callback `code` and returns the plaintext token set.
    pub async fn exchange_code(code: &str) -> MailSiftResult<TokenSet> {
        let client = Self::build_client()?;
        let http_client = build_http_client()?;
        let response = client
            .exchange_code(AuthorizationCode::new(code.to_owned()))
            .request_async(&http_client)
            .await
            .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::HttpResponseError))?;
        Ok(Self::token_set_from_response(&response, None))
    }

    /// Exchanges the refresh token for a new access token. A provider-side
    /// rejection is permanent: the user must reconnect.
    pub async fn refresh_access_token(refresh_token: &str) -> MailSiftResult<TokenSet> {
        let client = Self::build_client()?;
        let http_client = build_http_client()?;
        let response = client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.to_owned()))
            .request_async(&http_client)
            .await
            .map_err(|e| {
                raise_error!(
                    format!("The provider refused the token refresh: {}", e),
                    ErrorCode::AuthPermanent
                )
            })?;
        Ok(Self::token_set_from_response(
            &response,
            Some(refresh_token.to_owned()),
        ))
    }

    fn token_set_from_response(
        response: &oauth2::StandardTokenResponse<
            oauth2::EmptyExtraTokenFields,
            oauth2::basic::BasicTokenType,
        >,
        fallback_refresh: Option<String>,
    ) -> TokenSet {
        let expires_in_ms = response
            .expires_in()
            .map(|d| d.as_millis() as i64)
            .unwrap_or(60 * 60 * 1000);
        TokenSet {
            access_token: response.access_token().secret().to_owned(),
            refresh_token: response
                .refresh_token()
                .map(|t| t.secret().to_owned())
                .or(fallback_refresh),
            token_expiry: utc_now!() + expires_in_ms,
            scope: response
                .scopes()
                .map(|scopes| scopes.iter().map(|s| s.to_string()).collect())
                .unwrap_or_else(|| REQUESTED_SCOPES.iter().map(|s| s.to_string()).collect()),
        }
    }

    fn build_client() -> MailSiftResult<OAuth2Client> {
        let client_id = SETTINGS
            .mailsift_oauth_client_id
            .clone()
            .ok_or_else(|| missing("mailsift_oauth_client_id"))?;
        let client_secret = SETTINGS
            .mailsift_oauth_client_secret
            .clone()
            .ok_or_else(|| missing("mailsift_oauth_client_secret"))?;
        let redirect_uri = SETTINGS
            .mailsift_oauth_redirect_uri
            .clone()
            .ok_or_else(|| missing("mailsift_oauth_redirect_uri"))?;

        let auth_url = AuthUrl::new(GOOGLE_AUTH_URL.to_string())
            .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InvalidParameter))?;
        let token_url = TokenUrl::new(GOOGLE_TOKEN_URL.to_string())
            .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InvalidParameter))?;
        let redirect_uri = RedirectUrl::new(redirect_uri)
            .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InvalidParameter))?;

        Ok(BasicClient::new(ClientId::new(client_id))
            .set_client_secret(ClientSecret::new(client_secret))
            .set_auth_uri(auth_url)
            .set_token_uri(token_url)
            .set_redirect_uri(redirect_uri))
    }
}

fn missing(option: &str) -> crate::modules::error::MailSiftError {
    raise_error!(
        format!("OAuth is not configured: '{}' is unset", option),
        ErrorCode::MissingConfiguration
    )
}

fn build_http_client() -> MailSiftResult<reqwest::Client> {
    oauth2::reqwest::ClientBuilder::new()
        .redirect(oauth2::reqwest::redirect::Policy::none())
        .build()
        .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))
}
