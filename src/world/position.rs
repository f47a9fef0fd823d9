use std::cmp::Ordering;
use std::fmt;

/// Highest floor index; floors run 0 (sky) through 15 (deep underground).
pub const MAX_FLOOR: u8 = 15;
/// Surface floor.
pub const GROUND_FLOOR: u8 = 7;
pub const MAP_MAX_WIDTH: u16 = 65000;
pub const MAP_MAX_HEIGHT: u16 = 65000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Position {
    pub x: u16,
    pub y: u16,
    pub z: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    North,
    East,
    #[default]
    South,
    West,
    Northeast,
    Northwest,
    Southeast,
    Southwest,
}

impl Position {
    pub const fn new(x: u16, y: u16, z: u8) -> Self {
        Self { x, y, z }
    }

    pub fn is_valid(self) -> bool {
        self.z <= MAX_FLOOR
    }

    fn sort_key(self) -> (u8, u16, u16) {
        (self.z, self.y, self.x)
    }
}

// Floor-major, then row, then column: the order tiles are saved in.
impl Ord for Position {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

impl PartialOrd for Position {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}", self.x, self.y, self.z)
    }
}

impl Direction {
    pub fn to_byte(self) -> u8 {
        match self {
            Direction::North => 0,
            Direction::East => 1,
            Direction::South => 2,
            Direction::West => 3,
            Direction::Southwest => 4,
            Direction::Southeast => 5,
            Direction::Northwest => 6,
            Direction::Northeast => 7,
        }
    }

    pub fn from_byte(value: u8) -> Option<Self> {
        Some(match value {
            0 => Direction::North,
            1 => Direction::East,
            2 => Direction::South,
            3 => Direction::West,
            4 => Direction::Southwest,
            5 => Direction::Southeast,
            6 => Direction::Northwest,
            7 => Direction::Northeast,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [Direction; 8] = [
        Direction::North,
        Direction::East,
        Direction::South,
        Direction::West,
        Direction::Northeast,
        Direction::Northwest,
        Direction::Southeast,
        Direction::Southwest,
    ];

    #[test]
    fn direction_bytes_are_stable() {
        for direction in ALL {
            assert_eq!(Direction::from_byte(direction.to_byte()), Some(direction));
        }
        assert_eq!(Direction::from_byte(8), None);
    }

    #[test]
    fn floors_stop_at_the_deepest_level() {
        assert!(Position::new(10, 10, MAX_FLOOR).is_valid());
        assert!(Position::new(10, 10, GROUND_FLOOR).is_valid());
        assert!(!Position::new(10, 10, 16).is_valid());
    }

    #[test]
    fn ordering_is_floor_row_column() {
        let mut positions = vec![
            Position::new(5, 1, 7),
            Position::new(1, 2, 7),
            Position::new(9, 9, 6),
            Position::new(2, 1, 7),
        ];
        positions.sort();
        assert_eq!(
            positions,
            vec![
                Position::new(9, 9, 6),
                Position::new(2, 1, 7),
                Position::new(5, 1, 7),
                Position::new(1, 2, 7),
            ]
        );
    }
}
