use once_cell::sync::Lazy;
use std::env;

pub static ENDPOINT: Lazy<String> = Lazy::new(|| {
    env::var("MELI_ENDPOINT").unwrap_or_else(|_| "https://api.mercadolibre.com".to_string())
});

pub static APP_ID: Lazy<String> = Lazy::new(|| env::var("MELI_APP_ID").unwrap_or_default());

pub static APP_SECRET: Lazy<String> = Lazy::new(|| env::var("MELI_SECRET_KEY").unwrap_or_default());

pub static OAUTH_TOKEN_URL: Lazy<String> = Lazy::new(|| format!("{}/oauth/token", *ENDPOINT));
