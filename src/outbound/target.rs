/// A resolved outbound target. Exactly one variant is ever produced for a
/// given input string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendTarget {
    User(String),
    Party(String),
    Tag(String),
    Chat(String),
}

const CHANNEL_PREFIXES: &[&str] = &["application", "platform", "ep", "wecom", "wework"];

/// Parse an opaque target string into a user / department / tag / chat id.
///
/// A leading channel alias (`wecom:...`) is stripped first; explicit
/// `user:` / `party:` / `dept:` / `tag:` / `group:` / `chat:` prefixes win
/// next; the remainder falls back to heuristics — `wr`/`wc` ids are chats,
/// all-digit ids are departments, anything else is a user id.
pub fn resolve_target(raw: &str) -> SendTarget {
    let mut rest = raw.trim();

    if let Some((head, tail)) = rest.split_once(':') {
        let head = head.trim().to_ascii_lowercase();
        if CHANNEL_PREFIXES.contains(&head.as_str()) {
            rest = tail.trim();
        }
    }

    if let Some((head, tail)) = rest.split_once(':') {
        let id = tail.trim().to_string();
        match head.trim().to_ascii_lowercase().as_str() {
            "party" | "dept" => return SendTarget::Party(id),
            "tag" => return SendTarget::Tag(id),
            "group" | "chat" => return SendTarget::Chat(id),
            "user" => return SendTarget::User(id),
            _ => {}
        }
    }

    let lowered = rest.to_ascii_lowercase();
    if lowered.starts_with("wr") || lowered.starts_with("wc") {
        return SendTarget::Chat(rest.to_string());
    }
    if !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()) {
        return SendTarget::Party(rest.to_string());
    }
    SendTarget::User(rest.to_string())
}

impl SendTarget {
    pub fn id(&self) -> &str {
        match self {
            SendTarget::User(id)
            | SendTarget::Party(id)
            | SendTarget::Tag(id)
            | SendTarget::Chat(id) => id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_prefixes_win() {
        assert_eq!(resolve_target("party:42"), SendTarget::Party("42".into()));
        assert_eq!(resolve_target("dept:42"), SendTarget::Party("42".into()));
        assert_eq!(resolve_target("tag:dev"), SendTarget::Tag("dev".into()));
        assert_eq!(resolve_target("group:abc"), SendTarget::Chat("abc".into()));
        assert_eq!(resolve_target("chat:abc"), SendTarget::Chat("abc".into()));
        assert_eq!(resolve_target("user:1234"), SendTarget::User("1234".into()));
        assert_eq!(resolve_target("TAG:ops"), SendTarget::Tag("ops".into()));
    }

    #[test]
    fn channel_alias_is_stripped_first() {
        assert_eq!(resolve_target("wecom:tag:dev"), SendTarget::Tag("dev".into()));
        assert_eq!(
            resolve_target("Application:user:zhang"),
            SendTarget::User("zhang".into())
        );
        assert_eq!(resolve_target("ep:1234"), SendTarget::Party("1234".into()));
    }

    #[test]
    fn heuristics_on_bare_ids() {
        assert_eq!(
            resolve_target("wrAAA111"),
            SendTarget::Chat("wrAAA111".into())
        );
        assert_eq!(resolve_target("wcBBB"), SendTarget::Chat("wcBBB".into()));
        assert_eq!(resolve_target("2077"), SendTarget::Party("2077".into()));
        assert_eq!(resolve_target("zhangsan"), SendTarget::User("zhangsan".into()));
        assert_eq!(resolve_target("  lisi  "), SendTarget::User("lisi".into()));
    }

    #[test]
    fn unknown_prefix_falls_through_to_heuristics() {
        // "mail:li" has no recognized prefix; the whole string is a user id.
        assert_eq!(
            resolve_target("mail:li"),
            SendTarget::User("mail:li".into())
        );
    }
}
