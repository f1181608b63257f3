use std::fmt;

/// A packet-filter rule: the arguments that follow `-A <chain>`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Rule(Vec<String>);

// === impl Rule ===

impl Rule {
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(args.into_iter().map(Into::into).collect())
    }

    pub fn args(&self) -> &[String] {
        &self.0
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.0.push(arg.into());
        self
    }

    pub fn args_from<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.0.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn comment(self, comment: impl Into<String>) -> Self {
        self.args_from(["-m", "comment", "--comment"]).arg(comment)
    }

    pub fn jump(self, target: impl Into<String>) -> Self {
        self.arg("-j").arg(target)
    }

    /// The chain this rule jumps to, if any.
    pub fn target(&self) -> Option<&str> {
        self.0
            .windows(2)
            .find(|w| w[0] == "-j")
            .map(|w| w[1].as_str())
    }

    /// Parses a line of `iptables -S <chain>` output. Returns `None` for
    /// lines that do not append a rule to `chain`.
    pub fn parse_listed(chain: &str, line: &str) -> Option<Self> {
        let words = split_words(line);
        match words.as_slice() {
            [flag, c, rest @ ..] if flag == "-A" && c == chain => Some(Self(rest.to_vec())),
            _ => None,
        }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, arg) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            if arg.is_empty() || arg.contains(|c: char| c.is_whitespace() || c == '"') {
                write!(f, "\"{}\"", arg.replace('\\', "\\\\").replace('"', "\\\""))?;
            } else {
                f.write_str(arg)?;
            }
        }
        Ok(())
    }
}

/// Renders a ruleset as text that compares equal exactly when the rulesets
/// do, rule order included.
pub fn canonical(rules: &[Rule]) -> String {
    let mut out = String::new();
    for rule in rules {
        out.push_str(&rule.to_string());
        out.push('\n');
    }
    out
}

/// Splits a line into words, honoring double quotes and backslash escapes
/// the way `iptables -S` and `iptables-restore` write them.
fn split_words(line: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut word = String::new();
    let mut in_word = false;
    let mut quoted = false;
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' if quoted => {
                if let Some(next) = chars.next() {
                    word.push(next);
                }
            }
            '"' => {
                quoted = !quoted;
                in_word = true;
            }
            c if c.is_whitespace() && !quoted => {
                if in_word {
                    words.push(std::mem::take(&mut word));
                    in_word = false;
                }
            }
            c => {
                word.push(c);
                in_word = true;
            }
        }
    }
    if in_word {
        words.push(word);
    }
    words
}
