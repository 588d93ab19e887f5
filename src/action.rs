use crate::error::{EnvError, Result};

// =============================================================================
// Action Space
// =============================================================================

/// Number of buttons in a joypad vector: Up, Left, Down, Right, A, B.
pub const BUTTON_COUNT: usize = 6;

pub type Buttons = [u8; BUTTON_COUNT];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Action {
    Noop = 0,
    Up = 1,
    Down = 2,
    Left = 3,
    LeftA = 4,
    LeftB = 5,
    LeftAB = 6,
    Right = 7,
    RightA = 8,
    RightB = 9,
    RightAB = 10,
    A = 11,
    B = 12,
    AB = 13,
}

const ACTIONS: [Action; Action::COUNT] = [
    Action::Noop,
    Action::Up,
    Action::Down,
    Action::Left,
    Action::LeftA,
    Action::LeftB,
    Action::LeftAB,
    Action::Right,
    Action::RightA,
    Action::RightB,
    Action::RightAB,
    Action::A,
    Action::B,
    Action::AB,
];

impl Action {
    pub const COUNT: usize = 14;

    pub fn from_index(i: usize) -> Result<Self> {
        ACTIONS.get(i).copied().ok_or(EnvError::UnknownAction {
            index: i,
            count: Self::COUNT,
        })
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn to_buttons(self) -> Buttons {
        match self {
            Action::Noop => [0, 0, 0, 0, 0, 0],
            Action::Up => [1, 0, 0, 0, 0, 0],
            Action::Down => [0, 0, 1, 0, 0, 0],
            Action::Left => [0, 1, 0, 0, 0, 0],
            Action::LeftA => [0, 1, 0, 0, 1, 0],
            Action::LeftB => [0, 1, 0, 0, 0, 1],
            Action::LeftAB => [0, 1, 0, 0, 1, 1],
            Action::Right => [0, 0, 0, 1, 0, 0],
            Action::RightA => [0, 0, 0, 1, 1, 0],
            Action::RightB => [0, 0, 0, 1, 0, 1],
            Action::RightAB => [0, 0, 0, 1, 1, 1],
            Action::A => [0, 0, 0, 0, 1, 0],
            Action::B => [0, 0, 0, 0, 0, 1],
            Action::AB => [0, 0, 0, 0, 1, 1],
        }
    }
}

/// Looks up the button vector for a raw action index.
pub fn buttons_for(index: usize) -> Result<Buttons> {
    Action::from_index(index).map(Action::to_buttons)
}
