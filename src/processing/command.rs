//! Parsing of raw FTP command lines into a verb and its arguments.

/// A parsed FTP command line.
///
/// The verb is uppercased; arguments keep their case. Double or single
/// quotes group words so that paths with spaces survive (`MKD "my dir"`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    verb: String,
    args: Vec<String>,
}

impl Command {
    /// Parses `line`. An empty or all-whitespace line yields an empty verb.
    pub fn parse(line: &str) -> Self {
        let mut tokens = split_quoted(line).into_iter();
        let verb = tokens.next().map(|t| t.to_uppercase()).unwrap_or_default();
        Command {
            verb,
            args: tokens.collect(),
        }
    }

    /// The uppercased verb.
    pub fn verb(&self) -> &str {
        &self.verb
    }

    /// The arguments in order.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Number of arguments.
    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    /// True when the command has exactly `count` arguments.
    pub fn require(&self, count: usize) -> bool {
        self.args.len() == count
    }

    /// The argument at `index`, if present.
    pub fn arg(&self, index: usize) -> Option<&str> {
        self.args.get(index).map(String::as_str)
    }

    /// True when no verb was present at all.
    pub fn is_empty(&self) -> bool {
        self.verb.is_empty()
    }
}

fn split_quoted(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut in_token = false;

    for c in line.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None => match c {
                '"' | '\'' => {
                    quote = Some(c);
                    in_token = true;
                }
                c if c.is_whitespace() => {
                    if in_token {
                        tokens.push(std::mem::take(&mut current));
                        in_token = false;
                    }
                }
                c => {
                    current.push(c);
                    in_token = true;
                }
            },
        }
    }
    if in_token {
        tokens.push(current);
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parse_simple_command() {
        let cmd = Command::parse("USER alice");
        assert_eq!(cmd.verb(), "USER");
        assert_eq!(cmd.args(), ["alice"]);
        assert!(cmd.require(1));
        assert_eq!(cmd.arg(0), Some("alice"));
        assert_eq!(cmd.arg(1), None);
    }

    #[test]
    fn verb_is_uppercased_but_args_keep_case() {
        let cmd = Command::parse("stor Report.TXT");
        assert_eq!(cmd.verb(), "STOR");
        assert_eq!(cmd.arg(0), Some("Report.TXT"));
    }

    #[test]
    fn quotes_group_words() {
        let cmd = Command::parse("MKD \"my documents\"");
        assert_eq!(cmd.args(), ["my documents"]);

        let cmd = Command::parse("RNFR 'a b' c");
        assert_eq!(cmd.args(), ["a b", "c"]);
    }

    #[test]
    fn extra_whitespace_is_collapsed() {
        let cmd = Command::parse("  LIST    /docs  ");
        assert_eq!(cmd.verb(), "LIST");
        assert_eq!(cmd.args(), ["/docs"]);
    }

    #[test]
    fn empty_line_has_no_verb() {
        assert!(Command::parse("").is_empty());
        assert!(Command::parse("   ").is_empty());
        assert!(!Command::parse("NOOP").is_empty());
        assert!(Command::parse("NOOP").require(0));
    }
}
