/// Query-head to key/value-head mapping for grouped-query attention.
///
/// `num_heads_q` must be a multiple of `num_heads_k`; each consecutive group of
/// `num_heads_q / num_heads_k` query heads reads the same key/value head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadGroups {
    pub num_heads_q: usize,
    pub num_heads_k: usize,
}

impl HeadGroups {
    pub fn new(num_heads_q: usize, num_heads_k: usize) -> Self {
        Self {
            num_heads_q,
            num_heads_k,
        }
    }

    pub fn group_size(&self) -> usize {
        self.num_heads_q / self.num_heads_k
    }

    #[inline]
    pub fn kv_head(&self, q_head: usize) -> usize {
        let group_size = self.group_size();
        if group_size == 1 {
            q_head
        } else {
            q_head / group_size
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gqa_groups_share_kv_heads() {
        let groups = HeadGroups::new(8, 2);
        let mapped: Vec<usize> = (0..8).map(|h| groups.kv_head(h)).collect();
        assert_eq!(mapped, [0, 0, 0, 0, 1, 1, 1, 1]);
    }

    #[test]
    fn mha_and_mqa() {
        let mha = HeadGroups::new(4, 4);
        assert!((0..4).all(|h| mha.kv_head(h) == h));
        let mqa = HeadGroups::new(6, 1);
        assert!((0..6).all(|h| mqa.kv_head(h) == 0));
    }
}
