/// 计算两个 N 字节二进制向量的汉明距离
#[inline(always)]
pub fn hamming<const N: usize>(va: &[u8; N], vb: &[u8; N]) -> u32 {
    match N {
        32 => hamming_32(va, vb),
        _ => hamming_naive(va, vb),
    }
}

#[inline(always)]
pub fn hamming_naive<const N: usize>(va: &[u8; N], vb: &[u8; N]) -> u32 {
    va.iter().zip(vb).map(|(a, b)| (a ^ b).count_ones()).sum()
}

/// 32 字节（256 位）描述符的展开实现
#[inline(always)]
pub fn hamming_32(va: &[u8], vb: &[u8]) -> u32 {
    // 描述符按 u8 对齐，这里只能用 pod_read_unaligned
    let va: [u64; 4] = bytemuck::pod_read_unaligned(&va[..32]);
    let vb: [u64; 4] = bytemuck::pod_read_unaligned(&vb[..32]);
    (va[0] ^ vb[0]).count_ones()
        + (va[1] ^ vb[1]).count_ones()
        + (va[2] ^ vb[2]).count_ones()
        + (va[3] ^ vb[3]).count_ones()
}

/// 在 codes 中寻找与 query 距离最小的 k 个向量，返回 (下标, 距离)，按距离升序排列
///
/// 距离大于 max_distance 的向量会被忽略
pub fn knn_hamming<const N: usize>(
    query: &[u8; N],
    codes: &[[u8; N]],
    k: usize,
    max_distance: u32,
) -> Vec<(usize, u32)> {
    assert!(k <= 8, "k must be less than 8");
    let mut dis = [u32::MAX; 8];
    let mut idx = [0; 8];
    for (i, code) in codes.iter().enumerate() {
        let d = hamming::<N>(query, code);
        if d > max_distance || d >= dis[0] {
            continue;
        }
        // 维护一个长度为 K 的单调递减数组，最大的元素在前面
        // 距离相同时保留下标较小的，保证结果稳定
        for j in (0..k).rev() {
            if d < dis[j] {
                dis[..=j].rotate_left(1);
                dis[j] = d;
                idx[..=j].rotate_left(1);
                idx[j] = i;
                break;
            }
        }
    }
    idx.into_iter().zip(dis).filter(|(_, d)| *d != u32::MAX).rev().take(k).collect()
}

/// 描述符中每个 bit 的平均值，用于调试描述符的分布
pub fn bit_balance<const N: usize>(codes: &[[u8; N]]) -> f32 {
    if codes.is_empty() {
        return 0.0;
    }
    let ones: u32 = codes.as_flattened().iter().map(|b| b.count_ones()).sum();
    ones as f32 / (codes.len() * N * 8) as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hamming_identical() {
        let va = [0u8; 32];
        let vb = [0u8; 32];
        assert_eq!(hamming::<32>(&va, &vb), 0);
    }

    #[test]
    fn test_hamming_all_different() {
        let va = [0u8; 32];
        let vb = [255u8; 32];
        assert_eq!(hamming::<32>(&va, &vb), 256);
    }

    #[test]
    fn test_hamming_single_bit() {
        let va = [0u8; 1];
        let vb = [1u8; 1];
        assert_eq!(hamming::<1>(&va, &vb), 1);
    }

    #[test]
    fn test_knn_hamming_multiple_vectors() {
        let query = [0u8; 32];
        // 3 个向量，距离分别为 0, 2, 1
        let mut codes = vec![[0u8; 32]; 3];
        codes[1][0] = 3;
        codes[2][0] = 1;

        let r = knn_hamming(&query, &codes, 3, 256);
        assert_eq!(r, vec![(0, 0), (2, 1), (1, 2)]);
    }

    #[test]
    fn test_knn_hamming_k_limit() {
        let query = [0u8; 32];
        let codes = vec![[255u8; 32]; 2];
        // 请求 5 个，但只有 2 个向量
        let r = knn_hamming(&query, &codes, 5, 256);
        assert_eq!(r.iter().map(|x| x.0).collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn test_knn_hamming_k_smaller_than_codes() {
        let query = [0u8; 32];
        let mut codes = vec![[0u8; 32]; 5];
        for (i, code) in codes.iter_mut().enumerate() {
            code[0] = (1u8 << (5 - i)) - 1; // 距离 5,4,3,2,1
        }
        let r = knn_hamming(&query, &codes, 2, 256);
        assert_eq!(r, vec![(4, 1), (3, 2)]);
    }

    #[test]
    fn test_knn_hamming_max_distance() {
        let query = [0u8; 32];
        let codes = vec![[0u8; 32], [255u8; 32]];
        let r = knn_hamming(&query, &codes, 2, 64);
        assert_eq!(r, vec![(0, 0)]);
    }

    #[test]
    #[should_panic(expected = "k must be less than 8")]
    fn test_knn_hamming_k_too_large() {
        let query = [0u8; 32];
        knn_hamming(&query, &[[0u8; 32]], 11, 256);
    }
}
