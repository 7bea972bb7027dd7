//! eTLD+1 ("registrable domain") extraction, with a two-label fallback
//! when the public suffix list can't resolve a domain (spec.md §4.4,
//! §8 "Parent-domain extraction yields eTLD+1 when the public-suffix
//! table resolves; otherwise at most the last two labels joined by
//! '.'").

use addr::parse_domain_name;

/// Extract the parent (registrable) domain of `subdomain`.
///
/// Lowercases and trims a single trailing dot before lookup, matching
/// DNS's FQDN convention (spec.md §4.4 "trailing dots stripped").
pub fn parent_domain(subdomain: &str) -> String {
    let trimmed = subdomain.trim().trim_end_matches('.').to_ascii_lowercase();

    match parse_domain_name(&trimmed) {
        Ok(name) => match name.root() {
            Some(root) => root.to_string(),
            None => two_label_fallback(&trimmed),
        },
        Err(_) => two_label_fallback(&trimmed),
    }
}

fn two_label_fallback(domain: &str) -> String {
    let labels: Vec<&str> = domain.split('.').filter(|l| !l.is_empty()).collect();
    match labels.len() {
        0 => String::new(),
        1 => labels[0].to_string(),
        _ => labels[labels.len() - 2..].join("."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_trailing_dot_and_lowercases() {
        assert_eq!(parent_domain("WWW.Example.COM."), "example.com");
    }

    #[test]
    fn resolves_etld_plus_one_with_multi_label_suffix() {
        assert_eq!(parent_domain("api.staging.example.co.uk"), "example.co.uk");
    }

    #[test]
    fn deep_subdomain_collapses_to_apex() {
        assert_eq!(parent_domain("a.b.c.d.example.com"), "example.com");
    }

    #[test]
    fn single_label_falls_back_to_itself() {
        assert_eq!(parent_domain("localhost"), "localhost");
    }

    #[test]
    fn unresolvable_suffix_falls_back_to_last_two_labels() {
        assert_eq!(parent_domain("foo.bar.totally-bogus-tld-xyz"), "bar.totally-bogus-tld-xyz");
    }
}
