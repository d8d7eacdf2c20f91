//! Line classification for interactive device shells.
//!
//! A [`DeviceHandler`] looks at each line (or the trailing partial line) read
//! from a shell and decides whether it is plain output, a prompt that ends a
//! command, a pagination marker that must be answered, or a question such as
//! an enable-password prompt that needs input.

use std::collections::HashMap;

use log::trace;
use once_cell::sync::Lazy;
use regex::{Regex, RegexSet};

use crate::error::NetqueryError;

/// What a line read from the shell means to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineKind {
    /// Ordinary command output.
    Output,
    /// The device is ready for the next command.
    Prompt,
    /// A pagination marker; the payload is the keystroke that continues output.
    More(String),
    /// The device asks for input; the payload is what to send.
    Input(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Slot {
    Prompt,
    More,
    Input(usize),
}

/// Prompt-aware classifier for one device dialect.
#[derive(Debug, Clone)]
pub struct DeviceHandler {
    /// Combined regex set over prompt, pagination and input patterns.
    all_regex: RegexSet,

    /// Maps a regex index in `all_regex` to its meaning.
    slots: Vec<Slot>,

    /// Input answers: (is_dynamic, value or key into `dyn_param`).
    inputs: Vec<(bool, String)>,

    /// Values for dynamic inputs such as the enable password.
    pub dyn_param: HashMap<String, String>,

    /// Last line recognised as a prompt.
    current_prompt: Option<String>,
}

impl DeviceHandler {
    /// Creates a handler.
    ///
    /// # Arguments
    ///
    /// * `prompt` - regex patterns matching a ready prompt
    /// * `more_regex` - regex patterns matching pagination markers (answered with a space)
    /// * `write` - (regex pattern, (is_dynamic, value)) pairs for prompts that need input
    /// * `dyn_param` - values for dynamic inputs
    pub fn new<I, S>(
        prompt: I,
        more_regex: I,
        write: Vec<(S, (bool, String))>,
        dyn_param: HashMap<String, String>,
    ) -> Result<DeviceHandler, NetqueryError>
    where
        S: AsRef<str>,
        I: IntoIterator<Item = S>,
    {
        let mut regexs: Vec<String> = Vec::new();
        let mut slots = Vec::new();

        // Prompts may be preceded by NUL padding and a lone carriage return.
        for pattern in prompt {
            regexs.push(format!(
                r"^\x00*\r{{0,1}}{}",
                pattern.as_ref().trim_start_matches('^')
            ));
            slots.push(Slot::Prompt);
        }

        for pattern in more_regex {
            regexs.push(pattern.as_ref().to_string());
            slots.push(Slot::More);
        }

        let mut inputs = Vec::new();
        for (pattern, input) in write {
            regexs.push(pattern.as_ref().to_string());
            slots.push(Slot::Input(inputs.len()));
            inputs.push(input);
        }

        let all_regex = RegexSet::new(&regexs)?;

        Ok(Self {
            all_regex,
            slots,
            inputs,
            dyn_param,
            current_prompt: None,
        })
    }

    /// Classifies a line without changing any state.
    pub fn classify(&self, line: &str) -> LineKind {
        let Some(index) = self.all_regex.matches(line).into_iter().next() else {
            return LineKind::Output;
        };
        match self.slots.get(index) {
            Some(Slot::Prompt) => LineKind::Prompt,
            Some(Slot::More) => LineKind::More(" ".to_string()),
            Some(Slot::Input(i)) => match self.inputs.get(*i) {
                Some((true, key)) => match self.dyn_param.get(key) {
                    Some(value) => LineKind::Input(value.clone()),
                    None => LineKind::Output,
                },
                Some((false, value)) => LineKind::Input(value.clone()),
                None => LineKind::Output,
            },
            None => LineKind::Output,
        }
    }

    /// Classifies a line and remembers it when it is a prompt.
    pub fn read(&mut self, line: &str) -> LineKind {
        let kind = self.classify(line);
        trace!("Read line {:?} as {:?}", line, kind);
        if kind == LineKind::Prompt {
            self.current_prompt = Some(line.to_string());
        }
        kind
    }

    /// Returns true if the line is a ready prompt.
    pub fn read_prompt(&self, line: &str) -> bool {
        self.classify(line) == LineKind::Prompt
    }

    /// Returns the keystrokes to send if the line asks for input or more output.
    pub fn read_need_write(&self, line: &str) -> Option<String> {
        match self.classify(line) {
            LineKind::More(c) | LineKind::Input(c) => Some(c),
            LineKind::Output | LineKind::Prompt => None,
        }
    }

    /// Last prompt text seen by the handler.
    pub fn current_prompt(&self) -> Option<&str> {
        self.current_prompt.as_deref()
    }
}

/// Matches carriage returns and backspaces at the start of terminal lines.
pub static IGNORE_START_LINE: Lazy<Regex> =
    Lazy::new(
        || match Regex::new(r"^(\r+(\s+\r+)*)|(\u{8}+(\s+\u{8}+)*)") {
            Ok(re) => re,
            Err(err) => panic!("invalid IGNORE_START_LINE regex: {err}"),
        },
    );

/// Matches ANSI escape sequences emitted by some device shells.
pub static ANSI_ESCAPE: Lazy<Regex> =
    Lazy::new(|| match Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]") {
        Ok(re) => re,
        Err(err) => panic!("invalid ANSI_ESCAPE regex: {err}"),
    });

#[cfg(test)]
mod tests {
    use super::{DeviceHandler, IGNORE_START_LINE, LineKind};
    use crate::error::NetqueryError;
    use std::collections::HashMap;

    fn build_test_handler() -> DeviceHandler {
        let mut dyn_param = HashMap::new();
        dyn_param.insert("EnablePassword".to_string(), "secret\n".to_string());

        DeviceHandler::new(
            vec![r"^dev>\s*$", r"^dev#\s*$"],
            vec![r"^--More--$"],
            vec![
                (
                    r"^Password:\s*$",
                    (true, "EnablePassword".to_string()),
                ),
                (r"^\[y/n\]\?\s*$", (false, "y\n".to_string())),
            ],
            dyn_param,
        )
        .expect("test handler config should be valid")
    }

    #[test]
    fn prompt_lines_are_detected_and_remembered() {
        let mut handler = build_test_handler();
        assert_eq!(handler.current_prompt(), None);

        assert_eq!(handler.read("dev#"), LineKind::Prompt);
        assert_eq!(handler.current_prompt(), Some("dev#"));
    }

    #[test]
    fn prompt_after_carriage_return_is_detected() {
        let handler = build_test_handler();
        assert!(handler.read_prompt("\rdev>"));
    }

    #[test]
    fn read_need_write_supports_dynamic_static_and_more() {
        let handler = build_test_handler();

        assert_eq!(
            handler.read_need_write("Password:"),
            Some("secret\n".to_string())
        );
        assert_eq!(handler.read_need_write("[y/n]?"), Some("y\n".to_string()));
        assert_eq!(handler.read_need_write("--More--"), Some(" ".to_string()));
        assert_eq!(handler.read_need_write("Version 15.2"), None);
    }

    #[test]
    fn dynamic_input_without_value_is_plain_output() {
        let mut handler = build_test_handler();
        handler.dyn_param.clear();
        assert_eq!(handler.classify("Password:"), LineKind::Output);
    }

    #[test]
    fn invalid_handler_regex_returns_regex_error() {
        let err = DeviceHandler::new(
            vec![r"("],
            vec![],
            Vec::<(&str, (bool, String))>::new(),
            HashMap::new(),
        )
        .expect_err("invalid regex should fail");
        assert!(matches!(err, NetqueryError::InvalidRegex(_)));
    }

    #[test]
    fn leading_carriage_returns_are_stripped() {
        assert_eq!(IGNORE_START_LINE.replace("\r\rline", ""), "line");
    }
}
