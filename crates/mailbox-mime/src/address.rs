//! E-mail address parsing and marshalling.
//!
//! The cache stores address lists flattened to comma-separated
//! `Name <addr>` form; these functions are the two directions of that
//! round trip. Malformed input addresses may lose information, well
//! formed ones round-trip exactly.

/// A single e-mail address with an optional display name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Address {
    /// Display name, empty if absent.
    pub name: String,
    /// The `local@domain` part.
    pub address: String,
}

impl Address {
    /// Creates an address without a display name.
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            name: String::new(),
            address: address.into(),
        }
    }

    /// Creates an address with a display name.
    #[must_use]
    pub fn with_name(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
        }
    }

    /// Returns true if both name and address are empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.name.is_empty() && self.address.is_empty()
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", format_address(self))
    }
}

/// Formats one address as `Name <addr>`, or `<addr>` without a name.
#[must_use]
pub fn format_address(addr: &Address) -> String {
    if addr.name.is_empty() {
        format!("<{}>", addr.address)
    } else if addr.name.chars().all(is_atext_or_space) {
        format!("{} <{}>", addr.name, addr.address)
    } else {
        // Names with specials need quoting to survive a reparse.
        let escaped = addr.name.replace('\\', "\\\\").replace('"', "\\\"");
        format!("\"{escaped}\" <{}>", addr.address)
    }
}

/// Formats an address list as a comma-separated string.
#[must_use]
pub fn format_address_list(addrs: &[Address]) -> String {
    addrs
        .iter()
        .map(format_address)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Parses a single address in `Name <addr>`, `<addr>` or bare `addr`
/// form. Returns `None` for input with no address at all.
#[must_use]
pub fn parse_address(input: &str) -> Option<Address> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }

    if let Some(open) = input.rfind('<') {
        let close = input[open..].find('>')? + open;
        let address = input[open + 1..close].trim().to_string();
        if address.is_empty() {
            return None;
        }
        let name = unquote(input[..open].trim());
        return Some(Address { name, address });
    }

    // Bare addr-spec.
    if input.contains('@') {
        return Some(Address::new(input));
    }
    None
}

/// Parses a comma-separated address list, skipping entries that do not
/// contain an address.
#[must_use]
pub fn parse_address_list(input: &str) -> Vec<Address> {
    split_list(input)
        .iter()
        .filter_map(|part| parse_address(part))
        .collect()
}

/// Splits on commas that are outside quoted strings and angle brackets.
fn split_list(input: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    let mut in_brackets = false;
    let mut escaped = false;

    for (i, c) in input.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            '<' if !in_quotes => in_brackets = true,
            '>' if !in_quotes => in_brackets = false,
            ',' if !in_quotes && !in_brackets => {
                parts.push(&input[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&input[start..]);
    parts
}

fn unquote(s: &str) -> String {
    if s.len() >= 2 && s.starts_with('"') && s.ends_with('"') {
        s[1..s.len() - 1].replace("\\\"", "\"").replace("\\\\", "\\")
    } else {
        s.to_string()
    }
}

fn is_atext_or_space(c: char) -> bool {
    c.is_alphanumeric() || c == ' ' || "!#$%&'*+-/=?^_`{|}~.".contains(c)
}
