//! Class labels from TensorFlow object detection label maps.
//!
//! A label map is a `.pbtxt` file made of entries like
//!
//! ```text
//! item {
//!   name: "/m/01g317"
//!   id: 1
//!   display_name: "person"
//! }
//! ```

use std::{borrow::Cow, collections::HashMap, fs, path::Path};

use anyhow::{bail, Context};

#[derive(Debug, Clone, Default)]
pub struct LabelMap {
    labels: HashMap<u32, String>,
}

impl LabelMap {
    /// Loads a label map, falling back to an empty one if the file cannot be read.
    pub fn load_or_empty<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        match Self::load(path) {
            Ok(map) => {
                log::debug!("loaded {} labels from `{}`", map.len(), path.display());
                map
            }
            Err(e) => {
                log::warn!("{e:#}; detections will be labeled by class id");
                Self::default()
            }
        }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read label map `{}`", path.display()))?;
        Self::parse(&text).with_context(|| format!("malformed label map `{}`", path.display()))
    }

    /// Parses the text of a label map.
    ///
    /// For every item, `display_name` is preferred over `name`. Items without an `id` are an
    /// error; unknown fields are ignored.
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let mut labels = HashMap::new();
        let mut tokens = Tokens::new(text);
        while let Some(token) = tokens.next()? {
            if token != "item" {
                bail!("expected `item`, found `{token}`");
            }
            tokens.expect("{")?;

            let (mut id, mut name, mut display_name) = (None, None, None);
            loop {
                let Some(key) = tokens.next()? else {
                    bail!("unterminated `item` block");
                };
                if key == "}" {
                    break;
                }
                // The colon is optional in text protos.
                if tokens.peek_is(":") {
                    tokens.expect(":")?;
                }
                let Some(value) = tokens.next()? else {
                    bail!("missing value for `{key}`");
                };
                match key.as_str() {
                    "id" => {
                        id = Some(
                            value
                                .parse::<u32>()
                                .with_context(|| format!("invalid id `{value}`"))?,
                        )
                    }
                    "name" => name = Some(value),
                    "display_name" => display_name = Some(value),
                    other => log::trace!("ignoring label map field `{other}`"),
                }
            }

            let Some(id) = id else {
                bail!("label map item without `id`");
            };
            if let Some(label) = display_name.or(name) {
                labels.insert(id, label);
            }
        }
        Ok(Self { labels })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn get(&self, class: u32) -> Option<&str> {
        self.labels.get(&class).map(String::as_str)
    }

    /// Returns the label of `class`, or `class N` if the map does not know it.
    pub fn label(&self, class: u32) -> Cow<'_, str> {
        match self.get(class) {
            Some(label) => Cow::Borrowed(label),
            None => Cow::Owned(format!("class {class}")),
        }
    }
}

/// Splits label map text into words, quoted strings, `{`, `}`, and `:`.
struct Tokens<'a> {
    rest: &'a str,
    peeked: Option<String>,
}

impl<'a> Tokens<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            rest: text,
            peeked: None,
        }
    }

    fn next(&mut self) -> anyhow::Result<Option<String>> {
        if let Some(token) = self.peeked.take() {
            return Ok(Some(token));
        }
        self.lex()
    }

    fn peek_is(&mut self, expected: &str) -> bool {
        if self.peeked.is_none() {
            self.peeked = self.lex().ok().flatten();
        }
        self.peeked.as_deref() == Some(expected)
    }

    fn expect(&mut self, expected: &str) -> anyhow::Result<()> {
        match self.next()? {
            Some(token) if token == expected => Ok(()),
            Some(token) => bail!("expected `{expected}`, found `{token}`"),
            None => bail!("expected `{expected}`, found end of file"),
        }
    }

    fn lex(&mut self) -> anyhow::Result<Option<String>> {
        loop {
            self.rest = self.rest.trim_start();
            if let Some(comment) = self.rest.strip_prefix('#') {
                self.rest = comment.split_once('\n').map_or("", |(_, rest)| rest);
                continue;
            }
            break;
        }

        let Some(first) = self.rest.chars().next() else {
            return Ok(None);
        };
        match first {
            '{' | '}' | ':' => {
                self.rest = &self.rest[1..];
                Ok(Some(first.to_string()))
            }
            '"' | '\'' => {
                let body = &self.rest[1..];
                let Some(end) = body.find(first) else {
                    bail!("unterminated string");
                };
                self.rest = &body[end + 1..];
                Ok(Some(body[..end].to_string()))
            }
            _ => {
                let end = self
                    .rest
                    .find(|c: char| c.is_whitespace() || matches!(c, '{' | '}' | ':'))
                    .unwrap_or(self.rest.len());
                let word = &self.rest[..end];
                self.rest = &self.rest[end..];
                Ok(Some(word.to_string()))
            }
        }
    }
}
