use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use std::sync::mpsc::{self, Receiver};

#[derive(Debug)]
pub enum InputMessage {
    Event(Event),
    ReadError(String),
}

pub type InputReceiver = Receiver<InputMessage>;

/// Blocking terminal reads live on their own thread so the frame loop only
/// ever drains a channel.
pub fn spawn_input_thread() -> InputReceiver {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || loop {
        match event::read() {
            Ok(ev) => {
                if tx.send(InputMessage::Event(ev)).is_err() {
                    break;
                }
            }
            Err(err) => {
                let _ = tx.send(InputMessage::ReadError(err.to_string()));
                break;
            }
        }
    });
    rx
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Action {
    Quit,
    Orbit { yaw: f32, pitch: f32 },
    Zoom(f32),
    ToggleHud,
    ToggleAutoOrbit,
    ToggleCulling,
    Reframe,
}

const ORBIT_STEP: f32 = 0.05;

pub fn action_for(event: &Event) -> Option<Action> {
    let Event::Key(key) = event else {
        return None;
    };
    if !matches!(key.kind, KeyEventKind::Press | KeyEventKind::Repeat) {
        return None;
    }
    let action = match key.code {
        KeyCode::Esc => Action::Quit,
        KeyCode::Left => Action::Orbit { yaw: -ORBIT_STEP, pitch: 0.0 },
        KeyCode::Right => Action::Orbit { yaw: ORBIT_STEP, pitch: 0.0 },
        KeyCode::Up => Action::Orbit { yaw: 0.0, pitch: ORBIT_STEP },
        KeyCode::Down => Action::Orbit { yaw: 0.0, pitch: -ORBIT_STEP },
        KeyCode::Tab => Action::ToggleHud,
        KeyCode::Char(' ') => Action::ToggleAutoOrbit,
        KeyCode::Char('+') | KeyCode::Char('=') => Action::Zoom(1.0 / 1.1),
        KeyCode::Char('-') => Action::Zoom(1.1),
        KeyCode::Char(c) => match c.to_ascii_lowercase() {
            'q' => Action::Quit,
            'c' => Action::ToggleCulling,
            'r' => Action::Reframe,
            'w' => Action::Zoom(1.0 / 1.1),
            's' => Action::Zoom(1.1),
            'a' => Action::Orbit { yaw: -ORBIT_STEP, pitch: 0.0 },
            'd' => Action::Orbit { yaw: ORBIT_STEP, pitch: 0.0 },
            _ => return None,
        },
        _ => return None,
    };
    Some(action)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossterm::event::{KeyEvent, KeyModifiers};

    fn key(code: KeyCode, kind: KeyEventKind) -> Event {
        let mut event = KeyEvent::new(code, KeyModifiers::NONE);
        event.kind = kind;
        Event::Key(event)
    }

    #[test]
    fn presses_map_to_actions() {
        assert_eq!(action_for(&key(KeyCode::Char('Q'), KeyEventKind::Press)), Some(Action::Quit));
        assert_eq!(action_for(&key(KeyCode::Tab, KeyEventKind::Repeat)), Some(Action::ToggleHud));
        assert_eq!(
            action_for(&key(KeyCode::Left, KeyEventKind::Press)),
            Some(Action::Orbit { yaw: -ORBIT_STEP, pitch: 0.0 })
        );
    }

    #[test]
    fn releases_and_other_events_are_ignored() {
        assert_eq!(action_for(&key(KeyCode::Char('q'), KeyEventKind::Release)), None);
        assert_eq!(action_for(&Event::Resize(80, 24)), None);
        assert_eq!(action_for(&key(KeyCode::Char('z'), KeyEventKind::Press)), None);
    }
}
