// Display mode and key bindings
//
// Fullscreen is a display-server concern: toggling it never touches GPU
// resources. The resulting window geometry change arrives later as an
// ordinary resize.

use winit::keyboard::KeyCode;

/// Position and size of the window while it was windowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowPlacement {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

/// What the window layer has to do after a fullscreen request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FullscreenChange {
    /// Already in the requested mode
    Unchanged,
    Entered,
    /// Back to windowed; restore this placement if one was saved
    Left { restore: Option<WindowPlacement> },
}

#[derive(Debug, Default)]
pub struct FullscreenState {
    fullscreen: bool,
    saved: Option<WindowPlacement>,
}

impl FullscreenState {
    pub fn new(fullscreen: bool) -> Self {
        Self {
            fullscreen,
            saved: None,
        }
    }

    pub fn is_fullscreen(&self) -> bool {
        self.fullscreen
    }

    pub fn saved_placement(&self) -> Option<WindowPlacement> {
        self.saved
    }

    /// Switch modes. `current` is the window placement right now; it is saved
    /// when entering fullscreen and ignored otherwise.
    pub fn set(&mut self, enable: bool, current: WindowPlacement) -> FullscreenChange {
        if enable == self.fullscreen {
            return FullscreenChange::Unchanged;
        }
        self.fullscreen = enable;
        if enable {
            self.saved = Some(current);
            FullscreenChange::Entered
        } else {
            FullscreenChange::Left {
                restore: self.saved.take(),
            }
        }
    }
}

/// A key together with the modifier state that matters for bindings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyChord {
    pub key: KeyCode,
    pub alt: bool,
}

impl KeyChord {
    pub const fn plain(key: KeyCode) -> Self {
        Self { key, alt: false }
    }

    pub const fn alt(key: KeyCode) -> Self {
        Self { key, alt: true }
    }
}

/// Every chord that toggles fullscreen.
pub const FULLSCREEN_TRIGGERS: [KeyChord; 2] = [
    KeyChord::alt(KeyCode::Enter),
    KeyChord::plain(KeyCode::F11),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    ToggleFullscreen,
    ToggleVsync,
    Quit,
}

pub fn action_for(chord: KeyChord) -> Option<KeyAction> {
    if FULLSCREEN_TRIGGERS.contains(&chord) {
        return Some(KeyAction::ToggleFullscreen);
    }
    match chord {
        KeyChord {
            key: KeyCode::KeyV,
            alt: false,
        } => Some(KeyAction::ToggleVsync),
        KeyChord {
            key: KeyCode::Escape,
            ..
        } => Some(KeyAction::Quit),
        _ => None,
    }
}
