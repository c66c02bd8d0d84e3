pub type Headers = Vec<(String, String)>;

pub fn header_set(headers: &mut Headers, name: impl Into<String>, value: impl Into<String>) {
    let name = name.into();
    let value = value.into();
    let key = name.to_ascii_lowercase();
    if let Some((_, v)) = headers
        .iter_mut()
        .find(|(k, _)| k.to_ascii_lowercase() == key)
    {
        *v = value;
        return;
    }
    headers.push((name, value));
}

pub fn header_get<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    let key = name.to_ascii_lowercase();
    headers
        .iter()
        .find(|(k, _)| k.to_ascii_lowercase() == key)
        .map(|(_, v)| v.as_str())
}

pub fn header_remove(headers: &mut Headers, name: &str) -> Option<String> {
    let key = name.to_ascii_lowercase();
    let idx = headers
        .iter()
        .position(|(k, _)| k.to_ascii_lowercase() == key)?;
    Some(headers.remove(idx).1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_is_case_insensitive_and_overwrites() {
        let mut headers: Headers = Vec::new();
        header_set(&mut headers, "Authorization", "Bearer a");
        header_set(&mut headers, "authorization", "Bearer b");
        assert_eq!(headers.len(), 1);
        assert_eq!(header_get(&headers, "AUTHORIZATION"), Some("Bearer b"));
    }

    #[test]
    fn remove_returns_value_and_drops_entry() {
        let mut headers: Headers = Vec::new();
        header_set(&mut headers, "X-Account-Id", "42");
        assert_eq!(header_remove(&mut headers, "x-account-id"), Some("42".to_string()));
        assert!(header_get(&headers, "X-Account-Id").is_none());
    }
}
