//! ISP bucket resolution (design §4.3, glossary "ISP bucket").
//!
//! A fixed map from email domain to a canonical ISP bucket, used as the
//! coarse granularity of throttling between the per-domain and global
//! keys.

/// Canonical ISP buckets (design glossary).
pub fn isp_for_domain(domain: &str) -> &'static str {
    let domain = domain.to_ascii_lowercase();
    match domain.as_str() {
        "gmail.com" | "googlemail.com" => "gmail",
        "yahoo.com" | "yahoo.co.uk" | "ymail.com" | "rocketmail.com" => "yahoo",
        "outlook.com" | "hotmail.com" | "live.com" | "msn.com" => "microsoft",
        "aol.com" => "aol",
        "icloud.com" | "me.com" | "mac.com" => "apple",
        "comcast.net" => "comcast",
        "att.net" => "att",
        "verizon.net" => "verizon",
        _ => "other",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_known_domains() {
        assert_eq!(isp_for_domain("gmail.com"), "gmail");
        assert_eq!(isp_for_domain("Outlook.com"), "microsoft");
        assert_eq!(isp_for_domain("att.net"), "att");
    }

    #[test]
    fn unknown_domain_falls_back_to_other() {
        assert_eq!(isp_for_domain("example.com"), "other");
    }
}
