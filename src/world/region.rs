use crate::world::position::Position;

/// Inclusive box of map space, used to scope iteration and resyncs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub min: Position,
    pub max: Position,
}

impl Region {
    pub fn new(a: Position, b: Position) -> Self {
        let min = Position {
            x: a.x.min(b.x),
            y: a.y.min(b.y),
            z: a.z.min(b.z),
        };
        let max = Position {
            x: a.x.max(b.x),
            y: a.y.max(b.y),
            z: a.z.max(b.z),
        };
        Self { min, max }
    }

    pub fn single(position: Position) -> Self {
        Self {
            min: position,
            max: position,
        }
    }

    /// Square of `radius` tiles around `center` on its own floor.
    pub fn around(center: Position, radius: u16) -> Self {
        let min = Position {
            x: center.x.saturating_sub(radius),
            y: center.y.saturating_sub(radius),
            z: center.z,
        };
        let max = Position {
            x: center.x.saturating_add(radius),
            y: center.y.saturating_add(radius),
            z: center.z,
        };
        Self { min, max }
    }

    /// Smallest region covering every position, `None` for an empty set.
    pub fn bounding<I>(positions: I) -> Option<Self>
    where
        I: IntoIterator<Item = Position>,
    {
        let mut iter = positions.into_iter();
        let first = iter.next()?;
        let mut region = Self::single(first);
        for position in iter {
            region = Self::new(
                Position {
                    x: region.min.x.min(position.x),
                    y: region.min.y.min(position.y),
                    z: region.min.z.min(position.z),
                },
                Position {
                    x: region.max.x.max(position.x),
                    y: region.max.y.max(position.y),
                    z: region.max.z.max(position.z),
                },
            );
        }
        Some(region)
    }

    pub fn contains(&self, position: Position) -> bool {
        position.x >= self.min.x
            && position.x <= self.max.x
            && position.y >= self.min.y
            && position.y <= self.max.y
            && position.z >= self.min.z
            && position.z <= self.max.z
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn around_clamps_at_map_edge() {
        let region = Region::around(Position::new(1, 2, 7), 3);
        assert_eq!(region.min, Position::new(0, 0, 7));
        assert_eq!(region.max, Position::new(4, 5, 7));
        assert!(region.contains(Position::new(0, 5, 7)));
        assert!(!region.contains(Position::new(0, 5, 6)));
    }

    #[test]
    fn bounding_covers_all_points() {
        let region = Region::bounding([
            Position::new(5, 9, 7),
            Position::new(2, 11, 6),
            Position::new(8, 3, 7),
        ])
        .expect("region");
        assert_eq!(region.min, Position::new(2, 3, 6));
        assert_eq!(region.max, Position::new(8, 11, 7));
        assert_eq!(Region::bounding(std::iter::empty()), None);
    }
}
