//! Parser for the `INFO` reply shared by Redis and Predixy
//!
//! The reply is a list of `# Section` headers followed by `key:value` lines.
//! Keys may repeat inside a section (Predixy lists one block per backend
//! server), so entries keep their original order.

/// One `# Section` block
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Section {
    pub name: String,
    pub entries: Vec<(String, String)>,
}

/// Parsed `INFO` reply
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Info {
    sections: Vec<Section>,
}

/// Key counts of one logical database, from a `dbN:keys=..,expires=..` line
#[derive(Debug, Clone, PartialEq)]
pub struct Keyspace {
    pub db: String,
    pub keys: f64,
    pub expires: f64,
    pub avg_ttl: f64,
}

impl Info {
    pub fn parse(text: &str) -> Self {
        let mut sections: Vec<Section> = Vec::new();

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            if let Some(name) = line.strip_prefix('#') {
                sections.push(Section {
                    name: name.trim().to_string(),
                    entries: Vec::new(),
                });
                continue;
            }

            let Some((key, value)) = line.split_once(':') else {
                continue;
            };

            // Lines before the first header land in an unnamed section
            if sections.is_empty() {
                sections.push(Section::default());
            }
            if let Some(section) = sections.last_mut() {
                section
                    .entries
                    .push((key.trim().to_string(), value.trim().to_string()));
            }
        }

        Self { sections }
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    /// Entries of the section called `name`, compared case-insensitively
    pub fn section(&self, name: &str) -> Option<&[(String, String)]> {
        self.sections
            .iter()
            .find(|s| s.name.eq_ignore_ascii_case(name))
            .map(|s| s.entries.as_slice())
    }

    /// First value for `key` in any section
    pub fn value(&self, key: &str) -> Option<&str> {
        self.sections
            .iter()
            .flat_map(|s| s.entries.iter())
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// First value for `key` that parses as a number
    pub fn number(&self, key: &str) -> Option<f64> {
        self.value(key).and_then(parse_number)
    }

    /// Per-database key counts from the `Keyspace` section
    pub fn keyspace(&self) -> Vec<Keyspace> {
        let Some(entries) = self.section("Keyspace") else {
            return Vec::new();
        };

        entries
            .iter()
            .filter(|(db, _)| db.starts_with("db"))
            .map(|(db, value)| {
                let mut keyspace = Keyspace {
                    db: db.clone(),
                    keys: 0.0,
                    expires: 0.0,
                    avg_ttl: 0.0,
                };
                for field in value.split(',') {
                    let Some((name, raw)) = field.split_once('=') else {
                        continue;
                    };
                    let Some(num) = parse_number(raw) else {
                        continue;
                    };
                    match name {
                        "keys" => keyspace.keys = num,
                        "expires" => keyspace.expires = num,
                        "avg_ttl" => keyspace.avg_ttl = num,
                        _ => {}
                    }
                }
                keyspace
            })
            .collect()
    }
}

/// Parse a numeric `INFO` value, accepting the `ok`/`fail` style flags
pub fn parse_number(value: &str) -> Option<f64> {
    match value {
        "ok" | "true" | "up" => Some(1.0),
        "err" | "fail" | "false" | "down" => Some(0.0),
        _ => value.parse::<f64>().ok().filter(|v| v.is_finite()),
    }
}
