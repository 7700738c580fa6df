//! Keyboard bindings
//!
//! Pure key-to-action mapping, so bindings can be tested without a terminal.

use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
use riff_audio::EqBand;

/// Seconds moved by Left/Right
pub const SEEK_STEP_SECS: f64 = 5.0;
/// Seconds moved by Up/Down
pub const SEEK_JUMP_SECS: f64 = 30.0;
pub const TEMPO_STEP: f32 = 0.05;
pub const VOLUME_STEP: f32 = 0.05;
pub const EQ_STEP_DB: f32 = 1.5;
/// Length of the `b` loop
pub const QUICK_LOOP_BARS: u32 = 4;

/// Player action triggered by a key
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Action {
    TogglePlay,
    Seek(f64),
    AdjustTempo(f32),
    AdjustPitch(i32),
    AdjustVolume(f32),
    AdjustEq(EqBand, f32),
    ResetEq,
    /// Loop start at the playhead
    LoopIn,
    /// Loop end at the playhead
    LoopOut,
    ToggleLoop,
    HalveLoop,
    DoubleLoop,
    NudgeLoop(i32),
    ResizeLoop(i32),
    SnapLoop,
    SnapLoopStart,
    SnapLoopEnd,
    LoopFromHere(u32),
    ClearLoop,
    ExportLoop,
    Quit,
}

/// Action for `key`, if it is bound
pub fn action_for(key: KeyEvent) -> Option<Action> {
    if key.modifiers.contains(KeyModifiers::CONTROL) {
        return match key.code {
            KeyCode::Char('c') | KeyCode::Char('q') => Some(Action::Quit),
            _ => None,
        };
    }

    match key.code {
        KeyCode::Char(' ') => Some(Action::TogglePlay),
        KeyCode::Left => Some(Action::Seek(-SEEK_STEP_SECS)),
        KeyCode::Right => Some(Action::Seek(SEEK_STEP_SECS)),
        KeyCode::Down => Some(Action::Seek(-SEEK_JUMP_SECS)),
        KeyCode::Up => Some(Action::Seek(SEEK_JUMP_SECS)),

        // '=' is unshifted '+' on most layouts
        KeyCode::Char('+') | KeyCode::Char('=') => Some(Action::AdjustTempo(TEMPO_STEP)),
        KeyCode::Char('-') => Some(Action::AdjustTempo(-TEMPO_STEP)),
        KeyCode::Char(']') => Some(Action::AdjustPitch(1)),
        KeyCode::Char('[') => Some(Action::AdjustPitch(-1)),
        KeyCode::Char('v') => Some(Action::AdjustVolume(-VOLUME_STEP)),
        KeyCode::Char('V') => Some(Action::AdjustVolume(VOLUME_STEP)),

        KeyCode::Char('1') => Some(Action::AdjustEq(EqBand::Low, -EQ_STEP_DB)),
        KeyCode::Char('2') => Some(Action::AdjustEq(EqBand::Low, EQ_STEP_DB)),
        KeyCode::Char('3') => Some(Action::AdjustEq(EqBand::Mid, -EQ_STEP_DB)),
        KeyCode::Char('4') => Some(Action::AdjustEq(EqBand::Mid, EQ_STEP_DB)),
        KeyCode::Char('5') => Some(Action::AdjustEq(EqBand::High, -EQ_STEP_DB)),
        KeyCode::Char('6') => Some(Action::AdjustEq(EqBand::High, EQ_STEP_DB)),
        KeyCode::Char('0') => Some(Action::ResetEq),

        KeyCode::Char('i') => Some(Action::LoopIn),
        KeyCode::Char('o') => Some(Action::LoopOut),
        KeyCode::Char('l') => Some(Action::ToggleLoop),
        KeyCode::Char('h') => Some(Action::HalveLoop),
        KeyCode::Char('d') => Some(Action::DoubleLoop),
        KeyCode::Char(',') => Some(Action::NudgeLoop(-1)),
        KeyCode::Char('.') => Some(Action::NudgeLoop(1)),
        KeyCode::Char('<') => Some(Action::ResizeLoop(-1)),
        KeyCode::Char('>') => Some(Action::ResizeLoop(1)),
        KeyCode::Char('s') => Some(Action::SnapLoop),
        KeyCode::Char('{') => Some(Action::SnapLoopStart),
        KeyCode::Char('}') => Some(Action::SnapLoopEnd),
        KeyCode::Char('b') => Some(Action::LoopFromHere(QUICK_LOOP_BARS)),
        KeyCode::Char('c') => Some(Action::ClearLoop),

        KeyCode::Char('e') => Some(Action::ExportLoop),
        KeyCode::Char('q') | KeyCode::Esc => Some(Action::Quit),
        _ => None,
    }
}

/// One-line key reference for the status area
pub const HELP: &str = "space play  ←/→ ±5s  ↑/↓ ±30s  +/- tempo  [/] pitch  v/V vol  1-6 eq  0 flat  \
i/o in/out  l loop  h/d half/double  ,/. nudge  </> resize  s snap  {/} snap in/out  b 4 bars  c clear  e export  q quit";

#[cfg(test)]
mod tests {
    use super::*;

    fn key(code: KeyCode) -> KeyEvent {
        KeyEvent::new(code, KeyModifiers::NONE)
    }

    #[test]
    fn test_transport_keys() {
        assert_eq!(action_for(key(KeyCode::Char(' '))), Some(Action::TogglePlay));
        assert_eq!(action_for(key(KeyCode::Left)), Some(Action::Seek(-5.0)));
        assert_eq!(action_for(key(KeyCode::Up)), Some(Action::Seek(30.0)));
    }

    #[test]
    fn test_tempo_and_pitch_keys() {
        assert_eq!(action_for(key(KeyCode::Char('+'))), Some(Action::AdjustTempo(TEMPO_STEP)));
        assert_eq!(action_for(key(KeyCode::Char('='))), Some(Action::AdjustTempo(TEMPO_STEP)));
        assert_eq!(action_for(key(KeyCode::Char('-'))), Some(Action::AdjustTempo(-TEMPO_STEP)));
        assert_eq!(action_for(key(KeyCode::Char(']'))), Some(Action::AdjustPitch(1)));
        assert_eq!(action_for(key(KeyCode::Char('['))), Some(Action::AdjustPitch(-1)));
    }

    #[test]
    fn test_loop_keys() {
        assert_eq!(action_for(key(KeyCode::Char('i'))), Some(Action::LoopIn));
        assert_eq!(action_for(key(KeyCode::Char('o'))), Some(Action::LoopOut));
        assert_eq!(action_for(key(KeyCode::Char(','))), Some(Action::NudgeLoop(-1)));
        assert_eq!(action_for(key(KeyCode::Char('>'))), Some(Action::ResizeLoop(1)));
        assert_eq!(
            action_for(key(KeyCode::Char('b'))),
            Some(Action::LoopFromHere(QUICK_LOOP_BARS))
        );
        assert_eq!(action_for(key(KeyCode::Char('{'))), Some(Action::SnapLoopStart));
        assert_eq!(action_for(key(KeyCode::Char('}'))), Some(Action::SnapLoopEnd));
        assert_eq!(action_for(key(KeyCode::Char('c'))), Some(Action::ClearLoop));
    }

    #[test]
    fn test_eq_keys_pair_up_per_band() {
        for (down, up, band) in [('1', '2', EqBand::Low), ('3', '4', EqBand::Mid), ('5', '6', EqBand::High)] {
            assert_eq!(
                action_for(key(KeyCode::Char(down))),
                Some(Action::AdjustEq(band, -EQ_STEP_DB))
            );
            assert_eq!(
                action_for(key(KeyCode::Char(up))),
                Some(Action::AdjustEq(band, EQ_STEP_DB))
            );
        }
        assert_eq!(action_for(key(KeyCode::Char('0'))), Some(Action::ResetEq));
    }

    #[test]
    fn test_control_chords() {
        let ctrl_c = KeyEvent::new(KeyCode::Char('c'), KeyModifiers::CONTROL);
        assert_eq!(action_for(ctrl_c), Some(Action::Quit));

        // Ctrl+l is not the loop toggle
        let ctrl_l = KeyEvent::new(KeyCode::Char('l'), KeyModifiers::CONTROL);
        assert_eq!(action_for(ctrl_l), None);
    }

    #[test]
    fn test_unbound_key() {
        assert_eq!(action_for(key(KeyCode::Char('z'))), None);
        assert_eq!(action_for(key(KeyCode::F(5))), None);
    }
}
