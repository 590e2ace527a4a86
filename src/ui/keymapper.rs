//! Key mapping for terminal input
//!
//! Turns crossterm key events into either bytes for the active shell or a
//! host command. Host commands sit behind a tmux-style prefix (`Ctrl-B` by
//! default); pressing the prefix twice sends it through to the shell.

use bitflags::bitflags;
use crossterm::event::{KeyCode, KeyEvent, KeyEventKind, KeyModifiers};

bitflags! {
    /// Modifier keys
    #[derive(Clone, Copy, Debug, Default, PartialEq)]
    pub struct Modifiers: u8 {
        const SHIFT = 0b0001;
        const CTRL  = 0b0010;
        const ALT   = 0b0100;
    }
}

impl From<KeyModifiers> for Modifiers {
    fn from(mods: KeyModifiers) -> Self {
        let mut result = Modifiers::empty();
        if mods.contains(KeyModifiers::SHIFT) {
            result |= Modifiers::SHIFT;
        }
        if mods.contains(KeyModifiers::CONTROL) {
            result |= Modifiers::CTRL;
        }
        if mods.contains(KeyModifiers::ALT) {
            result |= Modifiers::ALT;
        }
        result
    }
}

impl Modifiers {
    /// xterm modifier parameter
    fn code(self) -> u8 {
        1 + u8::from(self.contains(Modifiers::SHIFT))
            + 2 * u8::from(self.contains(Modifiers::ALT))
            + 4 * u8::from(self.contains(Modifiers::CTRL))
    }
}

/// Commands handled by the host rather than the shell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostCommand {
    NewSession,
    NextSession,
    PrevSession,
    CloseSession,
    /// Zero-based position among open sessions
    GotoSession(usize),
    Paste,
    HistoryOlder,
    HistoryNewer,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyAction {
    /// Bytes for the active shell
    Send(Vec<u8>),
    Host(HostCommand),
}

/// Stateful key translator
#[derive(Debug, Clone)]
pub struct KeyMapper {
    prefix: char,
    /// Prefix was pressed, waiting for the command key
    armed: bool,
}

impl Default for KeyMapper {
    fn default() -> Self {
        Self::new('b')
    }
}

impl KeyMapper {
    pub fn new(prefix: char) -> Self {
        Self {
            prefix: prefix.to_ascii_lowercase(),
            armed: false,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Translate one key event; `None` means nothing to do
    pub fn translate(&mut self, event: &KeyEvent) -> Option<KeyAction> {
        if event.kind == KeyEventKind::Release {
            return None;
        }
        let mods = Modifiers::from(event.modifiers);

        if self.armed {
            self.armed = false;
            return self.prefixed(event.code, mods);
        }
        if self.is_prefix(event.code, mods) {
            self.armed = true;
            return None;
        }

        if mods == Modifiers::ALT {
            match event.code {
                KeyCode::Up => return Some(KeyAction::Host(HostCommand::HistoryOlder)),
                KeyCode::Down => return Some(KeyAction::Host(HostCommand::HistoryNewer)),
                _ => {}
            }
        }
        encode(event.code, mods).map(KeyAction::Send)
    }

    fn is_prefix(&self, code: KeyCode, mods: Modifiers) -> bool {
        mods == Modifiers::CTRL
            && matches!(code, KeyCode::Char(c) if c.to_ascii_lowercase() == self.prefix)
    }

    fn prefixed(&self, code: KeyCode, mods: Modifiers) -> Option<KeyAction> {
        if self.is_prefix(code, mods) {
            return Some(KeyAction::Send(encode_char(self.prefix, Modifiers::CTRL)));
        }
        let command = match code {
            KeyCode::Char('c') => HostCommand::NewSession,
            KeyCode::Char('n') => HostCommand::NextSession,
            KeyCode::Char('p') => HostCommand::PrevSession,
            KeyCode::Char('x') => HostCommand::CloseSession,
            KeyCode::Char(']') => HostCommand::Paste,
            KeyCode::Char('q') => HostCommand::Quit,
            // 1 is the first session, 0 the tenth
            KeyCode::Char(d @ '0'..='9') => {
                let n = d.to_digit(10)? as usize;
                HostCommand::GotoSession(if n == 0 { 9 } else { n - 1 })
            }
            _ => return None,
        };
        Some(KeyAction::Host(command))
    }
}

/// Bytes a terminal would send for this key
pub fn encode(code: KeyCode, mods: Modifiers) -> Option<Vec<u8>> {
    let bytes = match code {
        KeyCode::Char(ch) => encode_char(ch, mods),
        KeyCode::Enter => vec![0x0D],
        KeyCode::Backspace if mods.contains(Modifiers::ALT) => vec![0x1B, 0x7F],
        KeyCode::Backspace => vec![0x7F],
        KeyCode::Tab => vec![0x09],
        KeyCode::BackTab => b"\x1b[Z".to_vec(),
        KeyCode::Esc => vec![0x1B],
        KeyCode::Up => csi_letter(b'A', mods),
        KeyCode::Down => csi_letter(b'B', mods),
        KeyCode::Right => csi_letter(b'C', mods),
        KeyCode::Left => csi_letter(b'D', mods),
        KeyCode::Home => csi_letter(b'H', mods),
        KeyCode::End => csi_letter(b'F', mods),
        KeyCode::Insert => csi_tilde(2, mods),
        KeyCode::Delete => csi_tilde(3, mods),
        KeyCode::PageUp => csi_tilde(5, mods),
        KeyCode::PageDown => csi_tilde(6, mods),
        KeyCode::F(n @ 1..=4) => {
            let key = b"PQRS"[usize::from(n - 1)];
            if mods.is_empty() {
                vec![0x1B, b'O', key]
            } else {
                csi_letter(key, mods)
            }
        }
        KeyCode::F(n) => csi_tilde(function_tilde_code(n)?, mods),
        _ => return None,
    };
    Some(bytes)
}

fn encode_char(ch: char, mods: Modifiers) -> Vec<u8> {
    let ctrl = mods.contains(Modifiers::CTRL);
    let alt = mods.contains(Modifiers::ALT);

    if ctrl {
        let control = if ch.is_ascii_alphabetic() {
            Some((ch.to_ascii_lowercase() as u8) - b'a' + 1)
        } else {
            match ch {
                '@' | '`' | ' ' => Some(0x00),
                '[' => Some(0x1B),
                '\\' => Some(0x1C),
                ']' => Some(0x1D),
                '^' | '~' => Some(0x1E),
                '_' | '?' => Some(0x1F),
                _ => None,
            }
        };
        if let Some(byte) = control {
            return if alt { vec![0x1B, byte] } else { vec![byte] };
        }
    }

    let mut bytes = Vec::with_capacity(5);
    if alt {
        bytes.push(0x1B);
    }
    let mut buf = [0u8; 4];
    bytes.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
    bytes
}

/// `ESC [ <key>` or `ESC [ 1 ; <mod> <key>`
fn csi_letter(key: u8, mods: Modifiers) -> Vec<u8> {
    if mods.is_empty() {
        vec![0x1B, b'[', key]
    } else {
        format!("\x1b[1;{}{}", mods.code(), key as char).into_bytes()
    }
}

/// `ESC [ <n> ~` or `ESC [ <n> ; <mod> ~`
fn csi_tilde(n: u8, mods: Modifiers) -> Vec<u8> {
    if mods.is_empty() {
        format!("\x1b[{}~", n).into_bytes()
    } else {
        format!("\x1b[{};{}~", n, mods.code()).into_bytes()
    }
}

fn function_tilde_code(n: u8) -> Option<u8> {
    Some(match n {
        5 => 15,
        6 => 17,
        7 => 18,
        8 => 19,
        9 => 20,
        10 => 21,
        11 => 23,
        12 => 24,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(code: KeyCode, mods: KeyModifiers) -> KeyEvent {
        KeyEvent::new(code, mods)
    }

    fn send(bytes: &[u8]) -> Option<KeyAction> {
        Some(KeyAction::Send(bytes.to_vec()))
    }

    #[test]
    fn test_char_keys() {
        let mut mapper = KeyMapper::default();

        assert_eq!(mapper.translate(&key(KeyCode::Char('a'), KeyModifiers::NONE)), send(b"a"));
        assert_eq!(
            mapper.translate(&key(KeyCode::Char('c'), KeyModifiers::CONTROL)),
            send(&[0x03])
        );
        assert_eq!(
            mapper.translate(&key(KeyCode::Char('x'), KeyModifiers::ALT)),
            send(&[0x1B, b'x'])
        );
        assert_eq!(
            mapper.translate(&key(KeyCode::Char('é'), KeyModifiers::NONE)),
            send("é".as_bytes())
        );
    }

    #[test]
    fn test_arrow_and_function_keys() {
        assert_eq!(encode(KeyCode::Up, Modifiers::empty()), Some(b"\x1b[A".to_vec()));
        assert_eq!(encode(KeyCode::Up, Modifiers::CTRL), Some(b"\x1b[1;5A".to_vec()));
        assert_eq!(encode(KeyCode::F(1), Modifiers::empty()), Some(b"\x1bOP".to_vec()));
        assert_eq!(encode(KeyCode::F(2), Modifiers::SHIFT), Some(b"\x1b[1;2Q".to_vec()));
        assert_eq!(encode(KeyCode::F(5), Modifiers::empty()), Some(b"\x1b[15~".to_vec()));
        assert_eq!(encode(KeyCode::Delete, Modifiers::ALT), Some(b"\x1b[3;3~".to_vec()));
        assert_eq!(encode(KeyCode::F(13), Modifiers::empty()), None);
    }

    #[test]
    fn test_prefix_commands() {
        let mut mapper = KeyMapper::default();
        let prefix = key(KeyCode::Char('b'), KeyModifiers::CONTROL);

        assert_eq!(mapper.translate(&prefix), None);
        assert!(mapper.is_armed());
        assert_eq!(
            mapper.translate(&key(KeyCode::Char('c'), KeyModifiers::NONE)),
            Some(KeyAction::Host(HostCommand::NewSession))
        );
        assert!(!mapper.is_armed());

        mapper.translate(&prefix);
        assert_eq!(
            mapper.translate(&key(KeyCode::Char('1'), KeyModifiers::NONE)),
            Some(KeyAction::Host(HostCommand::GotoSession(0)))
        );
        mapper.translate(&prefix);
        assert_eq!(
            mapper.translate(&key(KeyCode::Char('0'), KeyModifiers::NONE)),
            Some(KeyAction::Host(HostCommand::GotoSession(9)))
        );
    }

    #[test]
    fn test_double_prefix_sends_control_byte() {
        let mut mapper = KeyMapper::default();
        let prefix = key(KeyCode::Char('b'), KeyModifiers::CONTROL);

        mapper.translate(&prefix);
        assert_eq!(mapper.translate(&prefix), send(&[0x02]));
    }

    #[test]
    fn test_unknown_prefixed_key_is_swallowed() {
        let mut mapper = KeyMapper::new('a');
        mapper.translate(&key(KeyCode::Char('a'), KeyModifiers::CONTROL));

        assert_eq!(mapper.translate(&key(KeyCode::Char('z'), KeyModifiers::NONE)), None);
        assert_eq!(mapper.translate(&key(KeyCode::Char('z'), KeyModifiers::NONE)), send(b"z"));
    }

    #[test]
    fn test_alt_arrows_recall_history() {
        let mut mapper = KeyMapper::default();
        assert_eq!(
            mapper.translate(&key(KeyCode::Up, KeyModifiers::ALT)),
            Some(KeyAction::Host(HostCommand::HistoryOlder))
        );
        assert_eq!(
            mapper.translate(&key(KeyCode::Down, KeyModifiers::ALT)),
            Some(KeyAction::Host(HostCommand::HistoryNewer))
        );
        // Plain arrows still go to the shell
        assert_eq!(mapper.translate(&key(KeyCode::Up, KeyModifiers::NONE)), send(b"\x1b[A"));
    }

    #[test]
    fn test_release_events_ignored() {
        let mut mapper = KeyMapper::default();
        let mut event = key(KeyCode::Char('a'), KeyModifiers::NONE);
        event.kind = KeyEventKind::Release;
        assert_eq!(mapper.translate(&event), None);
    }
}
