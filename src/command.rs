use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

// =============================================================================
// Controller Buttons
// =============================================================================

/// NES joypad buttons as understood by the emulator-side listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Button {
    Up = 0,
    Down = 1,
    Left = 2,
    Right = 3,
    A = 4,
    B = 5,
    Start = 6,
    Select = 7,
}

impl Button {
    pub const COUNT: usize = 8;

    pub const ALL: [Button; Self::COUNT] = [
        Button::Up,
        Button::Down,
        Button::Left,
        Button::Right,
        Button::A,
        Button::B,
        Button::Start,
        Button::Select,
    ];

    /// Key used for this button on the wire and in sprite configs
    pub fn wire_name(self) -> &'static str {
        match self {
            Button::Up => "up",
            Button::Down => "down",
            Button::Left => "left",
            Button::Right => "right",
            Button::A => "A",
            Button::B => "B",
            Button::Start => "start",
            Button::Select => "select",
        }
    }

    fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

impl fmt::Display for Button {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown button name: {0:?}")]
pub struct UnknownButton(pub String);

impl FromStr for Button {
    type Err = UnknownButton;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Button::ALL
            .into_iter()
            .find(|b| b.wire_name() == s)
            .ok_or_else(|| UnknownButton(s.to_string()))
    }
}

// =============================================================================
// Command Set
// =============================================================================

/// Set of buttons requested "pressed" for one frame. Absent buttons are released.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CommandSet(u8);

impl CommandSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn contains(&self, button: Button) -> bool {
        self.0 & button.bit() != 0
    }

    pub fn insert(&mut self, button: Button) {
        self.0 |= button.bit();
    }

    /// Returns true if the button was pressed before removal
    pub fn remove(&mut self, button: Button) -> bool {
        let was = self.contains(button);
        self.0 &= !button.bit();
        was
    }

    pub fn with(mut self, button: Button) -> Self {
        self.insert(button);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    /// Pressed buttons in declaration order
    pub fn iter(&self) -> impl Iterator<Item = Button> + use<> {
        let set = *self;
        Button::ALL.into_iter().filter(move |b| set.contains(*b))
    }

    /// Mirror the horizontal direction so the set faces `facing`.
    /// Sets without a horizontal direction are returned unchanged.
    pub fn facing(mut self, facing: Facing) -> Self {
        let had_left = self.remove(Button::Left);
        let had_right = self.remove(Button::Right);
        if had_left || had_right {
            match facing {
                Facing::Left => self.insert(Button::Left),
                Facing::Right => self.insert(Button::Right),
            }
        }
        self
    }
}

impl FromIterator<Button> for CommandSet {
    fn from_iter<I: IntoIterator<Item = Button>>(iter: I) -> Self {
        let mut set = CommandSet::empty();
        for b in iter {
            set.insert(b);
        }
        set
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Facing {
    Left,
    Right,
}

// =============================================================================
// Wire Codec
// =============================================================================

/// Newline-delimited JSON encoding of a [`CommandSet`]: `{"A":true,"left":true}\n`.
/// Keys are emitted sorted, so equal sets always encode to the same line.
pub struct CommandCodec;

impl CommandCodec {
    pub fn encode(set: &CommandSet) -> String {
        let mut map = Map::new();
        for button in set.iter() {
            map.insert(button.wire_name().to_string(), Value::Bool(true));
        }
        let mut line = Value::Object(map).to_string();
        line.push('\n');
        line
    }

    /// Parse one encoded line back into the set of pressed buttons.
    /// Keys mapped to `false` are treated as released.
    pub fn decode(line: &str) -> Result<CommandSet> {
        let value: Value =
            serde_json::from_str(line.trim_end()).context("command line is not valid JSON")?;
        let map = value
            .as_object()
            .context("command line must be a JSON object")?;
        let mut set = CommandSet::empty();
        for (key, pressed) in map {
            let button: Button = key.parse()?;
            match pressed.as_bool() {
                Some(true) => set.insert(button),
                Some(false) => {}
                None => anyhow::bail!("button {key} must map to a boolean"),
            }
        }
        Ok(set)
    }
}
