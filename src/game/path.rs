//! Grid Pathfinding
//!
//! Binary walkability grid with A* search. 4-connected moves, unit cost,
//! Manhattan heuristic (admissible for that move set). Paths include both
//! endpoints, so a path between adjacent cells has two waypoints.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use crate::core::Position;

/// Row-major walkability grid.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WalkGrid {
    width: usize,
    height: usize,
    cells: Vec<bool>,
}

impl WalkGrid {
    /// Build from a predicate evaluated at every cell.
    pub fn from_fn(width: usize, height: usize, mut walkable: impl FnMut(Position) -> bool) -> Self {
        let mut cells = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                cells.push(walkable(Position::new(x as i32, y as i32)));
            }
        }
        Self { width, height, cells }
    }

    /// Grid width.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Grid height.
    pub fn height(&self) -> usize {
        self.height
    }

    fn index(&self, pos: Position) -> Option<usize> {
        if pos.x < 0 || pos.y < 0 {
            return None;
        }
        let (x, y) = (pos.x as usize, pos.y as usize);
        if x >= self.width || y >= self.height {
            return None;
        }
        Some(y * self.width + x)
    }

    fn position(&self, index: usize) -> Position {
        Position::new((index % self.width) as i32, (index / self.width) as i32)
    }

    /// In bounds and walkable.
    pub fn is_walkable(&self, pos: Position) -> bool {
        self.index(pos).is_some_and(|i| self.cells[i])
    }

    /// Shortest 4-connected path from `start` to `end`, inclusive.
    ///
    /// None if either endpoint is blocked or out of bounds, or if no
    /// path exists.
    pub fn find_path(&self, start: Position, end: Position) -> Option<Vec<Position>> {
        let start_index = self.index(start).filter(|&i| self.cells[i])?;
        let end_index = self.index(end).filter(|&i| self.cells[i])?;

        if start_index == end_index {
            return Some(vec![start]);
        }

        let mut g_score = vec![u32::MAX; self.cells.len()];
        let mut came_from: Vec<Option<usize>> = vec![None; self.cells.len()];
        let mut closed = vec![false; self.cells.len()];
        // (f, h, index): ties on f prefer the node closer to the goal.
        let mut open: BinaryHeap<Reverse<(u32, u32, usize)>> = BinaryHeap::new();

        g_score[start_index] = 0;
        let h = start.manhattan(end);
        open.push(Reverse((h, h, start_index)));

        while let Some(Reverse((_, _, current))) = open.pop() {
            if current == end_index {
                return Some(self.reconstruct(&came_from, current));
            }
            if closed[current] {
                continue;
            }
            closed[current] = true;

            let current_pos = self.position(current);
            let tentative = g_score[current] + 1;
            for neighbour in current_pos.neighbours4() {
                let Some(next) = self.index(neighbour) else {
                    continue;
                };
                if !self.cells[next] || closed[next] {
                    continue;
                }
                if tentative < g_score[next] {
                    g_score[next] = tentative;
                    came_from[next] = Some(current);
                    let h = neighbour.manhattan(end);
                    open.push(Reverse((tentative + h, h, next)));
                }
            }
        }

        None
    }

    fn reconstruct(&self, came_from: &[Option<usize>], mut current: usize) -> Vec<Position> {
        let mut path = vec![self.position(current)];
        while let Some(prev) = came_from[current] {
            path.push(self.position(prev));
            current = prev;
        }
        path.reverse();
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(rows: &[&str]) -> WalkGrid {
        let height = rows.len();
        let width = rows[0].len();
        WalkGrid::from_fn(width, height, |p| {
            rows[p.y as usize].as_bytes()[p.x as usize] == b'.'
        })
    }

    #[test]
    fn test_straight_line() {
        let g = grid(&["....."]);
        let path = g.find_path(Position::new(0, 0), Position::new(4, 0)).unwrap();
        assert_eq!(path.len(), 5);
        assert_eq!(path.first(), Some(&Position::new(0, 0)));
        assert_eq!(path.last(), Some(&Position::new(4, 0)));
    }

    #[test]
    fn test_same_cell() {
        let g = grid(&["..", ".."]);
        let p = Position::new(1, 1);
        assert_eq!(g.find_path(p, p), Some(vec![p]));
    }

    #[test]
    fn test_detours_around_wall() {
        let g = grid(&[
            ".#...",
            ".#.#.",
            "...#.",
        ]);
        let path = g.find_path(Position::new(0, 0), Position::new(4, 0)).unwrap();
        // Down the left column, under the wall, back up and across the top.
        assert_eq!(path.len(), 9);
        for pair in path.windows(2) {
            assert_eq!(pair[0].manhattan(pair[1]), 1);
            assert!(g.is_walkable(pair[1]));
        }
    }

    #[test]
    fn test_unreachable() {
        let g = grid(&[
            "..#..",
            "..#..",
        ]);
        assert_eq!(g.find_path(Position::new(0, 0), Position::new(4, 1)), None);
    }

    #[test]
    fn test_blocked_or_out_of_bounds_endpoints() {
        let g = grid(&[".#."]);
        assert_eq!(g.find_path(Position::new(0, 0), Position::new(1, 0)), None);
        assert_eq!(g.find_path(Position::new(0, 0), Position::new(9, 0)), None);
        assert_eq!(g.find_path(Position::new(-1, 0), Position::new(0, 0)), None);
    }

    #[test]
    fn test_path_is_shortest() {
        let g = WalkGrid::from_fn(10, 10, |_| true);
        let start = Position::new(2, 3);
        let end = Position::new(7, 9);
        let path = g.find_path(start, end).unwrap();
        assert_eq!(path.len() as u32, start.manhattan(end) + 1);
    }
}
