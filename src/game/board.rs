use super::robot::RobotId;

/// Square grid of cells, each empty or holding one robot id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Board {
    size: usize,
    cells: Vec<Option<RobotId>>,
}

impl Board {
    pub fn new(size: usize) -> Board {
        Board {
            size,
            cells: vec![None; size * size],
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// The cell at signed coordinates, if they lie on the board.
    pub fn locate(&self, row: i64, col: i64) -> Option<(usize, usize)> {
        let on_board = |v: i64| v >= 0 && (v as u64) < self.size as u64;
        (on_board(row) && on_board(col)).then_some((row as usize, col as usize))
    }

    pub fn get(&self, (row, col): (usize, usize)) -> Option<RobotId> {
        self.cells[row * self.size + col]
    }

    pub fn set(&mut self, (row, col): (usize, usize), robot: Option<RobotId>) {
        self.cells[row * self.size + col] = robot;
    }

    /// Occupied cells in row-major order.
    pub fn occupied(&self) -> impl Iterator<Item = ((usize, usize), RobotId)> + '_ {
        self.cells
            .iter()
            .enumerate()
            .filter_map(|(i, cell)| cell.map(|id| ((i / self.size, i % self.size), id)))
    }

    pub fn row(&self, row: usize) -> &[Option<RobotId>] {
        &self.cells[row * self.size..(row + 1) * self.size]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locate_rejects_cells_off_the_board() {
        let board = Board::new(4);
        assert_eq!(board.locate(3, 0), Some((3, 0)));
        assert_eq!(board.locate(-1, 0), None);
        assert_eq!(board.locate(0, 4), None);
    }

    #[test]
    fn occupied_is_row_major() {
        let mut board = Board::new(3);
        board.set((2, 0), Some(5));
        board.set((0, 1), Some(9));
        let cells: Vec<_> = board.occupied().collect();
        assert_eq!(cells, vec![((0, 1), 9), ((2, 0), 5)]);
        assert_eq!(board.row(2), &[Some(5), None, None]);
    }
}
