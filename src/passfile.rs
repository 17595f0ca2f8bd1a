//! `.pgpass` credential file support.

use std::path::Path;

use tracing::warn;

/// One record of a passfile. `None` fields are `*` wildcards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassEntry {
    pub host: Option<String>,
    pub port: Option<String>,
    pub database: Option<String>,
    pub user: Option<String>,
    pub password: String,
}

impl PassEntry {
    fn matches(&self, host: &str, port: &str, database: &str, user: &str) -> bool {
        fn field(pattern: &Option<String>, value: &str) -> bool {
            pattern.as_deref().map_or(true, |p| p == value)
        }
        field(&self.host, host)
            && field(&self.port, port)
            && field(&self.database, database)
            && field(&self.user, user)
    }
}

/// Parse passfile contents. Malformed lines are skipped.
pub fn parse(contents: &str) -> Vec<PassEntry> {
    contents
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(parse_line)
        .collect()
}

fn parse_line(line: &str) -> Option<PassEntry> {
    let mut fields = Vec::with_capacity(5);
    let mut current = String::new();
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => current.push(chars.next().unwrap_or('\\')),
            ':' if fields.len() < 4 => fields.push(std::mem::take(&mut current)),
            c => current.push(c),
        }
    }
    fields.push(current);
    if fields.len() != 5 {
        return None;
    }

    let mut fields = fields.into_iter();
    let mut wildcard = |s: String| if s == "*" { None } else { Some(s) };
    Some(PassEntry {
        host: fields.next().and_then(&mut wildcard),
        port: fields.next().and_then(&mut wildcard),
        database: fields.next().and_then(&mut wildcard),
        user: fields.next().and_then(&mut wildcard),
        password: fields.next()?,
    })
}

/// Find the password for the first `(host, port)` pair that has a record.
///
/// Socket directory hosts are matched as `localhost`.
pub fn lookup(
    entries: &[PassEntry],
    hosts: &[(String, u16)],
    database: &str,
    user: &str,
) -> Option<String> {
    hosts.iter().find_map(|(host, port)| {
        let host = if host.starts_with('/') {
            "localhost"
        } else {
            host.as_str()
        };
        let port = port.to_string();
        entries
            .iter()
            .find(|e| e.matches(host, &port, database, user))
            .map(|e| e.password.clone())
    })
}

/// Read a passfile, refusing files that are not private regular files.
pub fn load(path: &Path) -> Vec<PassEntry> {
    let meta = match std::fs::metadata(path) {
        Ok(meta) => meta,
        Err(_) => return Vec::new(),
    };
    if !meta.is_file() {
        warn!(path = %path.display(), "password file is not a plain file");
        return Vec::new();
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if meta.permissions().mode() & 0o077 != 0 {
            warn!(
                path = %path.display(),
                "password file has group or world access; permissions should be u=rw (0600) or less"
            );
            return Vec::new();
        }
    }
    match std::fs::read_to_string(path) {
        Ok(contents) => parse(&contents),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "could not read password file");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# comment
db.internal:5432:orders:app:first
*:*:*:app:fallback

esc\\:aped:5432:*:*:p\\\\w\\:d
";

    #[test]
    fn test_parse_entries() {
        let entries = parse(SAMPLE);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].host.as_deref(), Some("db.internal"));
        assert_eq!(entries[1].host, None);
        assert_eq!(entries[2].host.as_deref(), Some("esc:aped"));
        assert_eq!(entries[2].password, "p\\w:d");
    }

    #[test]
    fn test_first_match_wins() {
        let entries = parse(SAMPLE);
        let hosts = vec![("db.internal".to_string(), 5432)];
        assert_eq!(lookup(&entries, &hosts, "orders", "app").as_deref(), Some("first"));
        assert_eq!(lookup(&entries, &hosts, "billing", "app").as_deref(), Some("fallback"));
        assert_eq!(lookup(&entries, &hosts, "orders", "other"), None);
    }

    #[test]
    fn test_socket_host_matches_localhost() {
        let entries = parse("localhost:5432:*:*:local\n");
        let hosts = vec![("/var/run/postgresql".to_string(), 5432)];
        assert_eq!(lookup(&entries, &hosts, "db", "u").as_deref(), Some("local"));
    }

    #[test]
    fn test_short_lines_are_skipped() {
        assert!(parse("host:5432:db:user\n").is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_load_rejects_world_readable_file() {
        use std::io::Write;
        use std::os::unix::fs::PermissionsExt;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "*:*:*:*:secret").unwrap();

        std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o644)).unwrap();
        assert!(load(file.path()).is_empty());

        std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o600)).unwrap();
        assert_eq!(load(file.path()).len(), 1);
    }

    #[test]
    fn test_load_rejects_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(dir.path()).is_empty());
    }
}
