use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ring::hmac;

/// `url` followed by every `key` + `value`, keys in ascending order.
pub fn canonical_string<'a, I>(url: &str, params: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut pairs: Vec<(&str, &str)> = params.into_iter().collect();
    pairs.sort_by(|a, b| a.0.cmp(b.0));
    let mut canonical = url.to_string();
    for (key, value) in pairs {
        canonical.push_str(key);
        canonical.push_str(value);
    }
    canonical
}

/// base64(HMAC-SHA1(auth_token, canonical_string)); empty without a token.
pub fn sign<'a, I>(auth_token: Option<&str>, url: &str, params: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let token = match auth_token {
        Some(token) if !token.is_empty() => token,
        _ => return String::new(),
    };
    let key = hmac::Key::new(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, token.as_bytes());
    let tag = hmac::sign(&key, canonical_string(url, params).as_bytes());
    STANDARD.encode(tag.as_ref())
}
