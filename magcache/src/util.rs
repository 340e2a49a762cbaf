/// Divide, rounding up
pub const fn divroundup(num: usize, divisor: usize) -> usize {
    (num + divisor - 1) / divisor
}

/// Round `num` up to the next multiple of `multiple`
pub const fn roundto(num: usize, multiple: usize) -> usize {
    divroundup(num, multiple) * multiple
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn divroundup_test() {
        assert_eq!(divroundup(0, 4), 0);
        assert_eq!(divroundup(4, 4), 1);
        assert_eq!(divroundup(5, 4), 2);
    }

    #[test]
    fn roundto_test() {
        assert_eq!(roundto(0, 8), 0);
        assert_eq!(roundto(1, 8), 8);
        assert_eq!(roundto(8, 8), 8);
        assert_eq!(roundto(9, 8), 16);
    }
}
