//! EAN-13 / UPC-A / EAN-8 / UPC-E 扫描线解码

use super::{Decoded, QUIET_MODULES, Run, Symbology, bar_starts, closest_pattern};

/// 单个数字的编码与理想宽度的最大允许误差，单位为模块
const MAX_DIGIT_ERROR: f32 = 1.6;
/// UPC-E 右侧没有护线可以区分 EAN，需要更宽的留白
const UPCE_TRAILING_QUIET: f32 = 5.0;

/// 左侧数字 L 编码的模块宽度，依次为 空 条 空 条
///
/// G 编码是 L 编码的逆序，右侧 R 编码与 L 编码宽度相同、颜色相反
const L_WIDTHS: [[u8; 4]; 10] = [
    [3, 2, 1, 1],
    [2, 2, 2, 1],
    [2, 1, 2, 2],
    [1, 4, 1, 1],
    [1, 1, 3, 2],
    [1, 2, 3, 1],
    [1, 1, 1, 4],
    [1, 3, 1, 2],
    [1, 2, 1, 3],
    [3, 1, 1, 2],
];

/// EAN-13 首位数字对应的左半部分奇偶性，true 表示 G 编码
///
/// UPC-E 数制 0 的奇偶性与之相反，数制 1 与之相同
const FIRST_DIGIT_PARITY: [[bool; 6]; 10] = {
    const L: bool = false;
    const G: bool = true;
    [
        [L, L, L, L, L, L],
        [L, L, G, L, G, G],
        [L, L, G, G, L, G],
        [L, L, G, G, G, L],
        [L, G, L, L, G, G],
        [L, G, G, L, L, G],
        [L, G, G, G, L, L],
        [L, G, L, G, L, G],
        [L, G, L, G, G, L],
        [L, G, G, L, G, L],
    ]
};

/// 左右护线 3 条，中间分隔符 5 条，UPC-E 结束符 6 条，每个数字 4 条
const GUARD_RUNS: usize = 3;
const MIDDLE_RUNS: usize = 5;
const UPCE_END_RUNS: usize = 6;
const DIGIT_RUNS: usize = 4;

#[derive(Debug, Clone, Copy)]
enum Format {
    Ean13,
    Ean8,
}

impl Format {
    /// 每半边的数字数量
    fn half_digits(self) -> usize {
        match self {
            Self::Ean13 => 6,
            Self::Ean8 => 4,
        }
    }

    fn total_runs(self) -> usize {
        2 * GUARD_RUNS + MIDDLE_RUNS + 2 * self.half_digits() * DIGIT_RUNS
    }

    fn total_modules(self) -> u32 {
        (3 + 3 + 5 + 2 * self.half_digits() * 7) as u32
    }
}

pub(super) fn decode_runs(runs: &[Run]) -> Option<Decoded> {
    bar_starts(runs).find_map(|start| {
        decode_at(runs, start, Format::Ean13)
            .or_else(|| decode_at(runs, start, Format::Ean8))
            .or_else(|| decode_upce_at(runs, start))
    })
}

/// 尝试从 runs[start] 开始按指定格式解码
fn decode_at(runs: &[Run], start: usize, format: Format) -> Option<Decoded> {
    let symbol = runs.get(start..start + format.total_runs())?;
    let module = module_width(symbol, format.total_modules());
    if (runs[start - 1].len as f32) < module * QUIET_MODULES {
        return None;
    }

    let half = format.half_digits();
    let left_start = GUARD_RUNS;
    let middle_start = left_start + half * DIGIT_RUNS;
    let right_start = middle_start + MIDDLE_RUNS;
    let end_start = right_start + half * DIGIT_RUNS;

    let mut guards = symbol[..GUARD_RUNS]
        .iter()
        .chain(&symbol[middle_start..right_start])
        .chain(&symbol[end_start..]);
    if !guards.all(|r| is_single_module(r.len, module)) {
        return None;
    }

    let mut digits = Vec::with_capacity(half * 2 + 1);
    let mut parity = Vec::with_capacity(half);
    for chunk in symbol[left_start..middle_start].chunks_exact(DIGIT_RUNS) {
        let (digit, is_g) = decode_digit(chunk, true)?;
        digits.push(digit);
        parity.push(is_g);
    }
    for chunk in symbol[right_start..end_start].chunks_exact(DIGIT_RUNS) {
        let (digit, _) = decode_digit(chunk, false)?;
        digits.push(digit);
    }

    match format {
        Format::Ean8 => {
            if parity.iter().any(|&g| g) || !check_digit_ok(&digits) {
                return None;
            }
            Some(Decoded { text: to_text(&digits), symbology: Symbology::Ean8 })
        }
        Format::Ean13 => {
            let first = FIRST_DIGIT_PARITY.iter().position(|p| p[..] == parity[..])? as u8;
            digits.insert(0, first);
            if !check_digit_ok(&digits) {
                return None;
            }
            if first == 0 {
                Some(Decoded { text: to_text(&digits[1..]), symbology: Symbology::UpcA })
            } else {
                Some(Decoded { text: to_text(&digits), symbology: Symbology::Ean13 })
            }
        }
    }
}

/// UPC-E：6 个数字，数制和校验位由奇偶性编码，展开为 UPC-A 后校验
fn decode_upce_at(runs: &[Run], start: usize) -> Option<Decoded> {
    let total_runs = GUARD_RUNS + 6 * DIGIT_RUNS + UPCE_END_RUNS;
    let symbol = runs.get(start..start + total_runs)?;
    let module = module_width(symbol, 3 + 6 * 7 + 6);
    if (runs[start - 1].len as f32) < module * QUIET_MODULES {
        return None;
    }
    if runs.get(start + total_runs).is_some_and(|r| (r.len as f32) < module * UPCE_TRAILING_QUIET) {
        return None;
    }

    let end_start = GUARD_RUNS + 6 * DIGIT_RUNS;
    let mut guards = symbol[..GUARD_RUNS].iter().chain(&symbol[end_start..]);
    if !guards.all(|r| is_single_module(r.len, module)) {
        return None;
    }

    let mut digits = [0u8; 6];
    let mut parity = [false; 6];
    for (i, chunk) in symbol[GUARD_RUNS..end_start].chunks_exact(DIGIT_RUNS).enumerate() {
        (digits[i], parity[i]) = decode_digit(chunk, true)?;
    }

    let (system, check) = (0..2u8).find_map(|system| {
        FIRST_DIGIT_PARITY.iter().position(|p| p.iter().zip(&parity).all(|(&a, &b)| (a == b) == (system == 1))).map(|c| (system, c as u8))
    })?;

    let mut upca = expand_upce(system, &digits).to_vec();
    upca.push(check);
    if !check_digit_ok(&upca) {
        return None;
    }

    let mut text = vec![system];
    text.extend_from_slice(&digits);
    text.push(check);
    Some(Decoded { text: to_text(&text), symbology: Symbology::UpcE })
}

/// UPC-E 的 6 位数字展开为不含校验位的 11 位 UPC-A
fn expand_upce(system: u8, d: &[u8; 6]) -> [u8; 11] {
    match d[5] {
        0..=2 => [system, d[0], d[1], d[5], 0, 0, 0, 0, d[2], d[3], d[4]],
        3 => [system, d[0], d[1], d[2], 0, 0, 0, 0, 0, d[3], d[4]],
        4 => [system, d[0], d[1], d[2], d[3], 0, 0, 0, 0, 0, d[4]],
        _ => [system, d[0], d[1], d[2], d[3], d[4], 0, 0, 0, 0, d[5]],
    }
}

fn module_width(symbol: &[Run], modules: u32) -> f32 {
    symbol.iter().map(|r| r.len).sum::<u32>() as f32 / modules as f32
}

fn is_single_module(len: u32, module: f32) -> bool {
    let ratio = len as f32 / module;
    (0.4..=1.8).contains(&ratio)
}

/// 匹配单个数字，返回 (数字, 是否为 G 编码)
fn decode_digit(runs: &[Run], left: bool) -> Option<(u8, bool)> {
    let (l, l_error) = closest_pattern(runs, &L_WIDTHS, 7)?;
    let mut best = (l, false, l_error);
    if left {
        let reversed = runs.iter().rev().copied().collect::<Vec<_>>();
        let (g, g_error) = closest_pattern(&reversed, &L_WIDTHS, 7)?;
        if g_error < l_error {
            best = (g, true, g_error);
        }
    }
    let (digit, is_g, error) = best;
    (error <= MAX_DIGIT_ERROR).then_some((digit as u8, is_g))
}

/// 校验位：从右往左奇数位权重为 1，偶数位权重为 3（不含校验位时相反）
fn check_digit_ok(digits: &[u8]) -> bool {
    let sum: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(i, &d)| if i % 2 == 1 { d as u32 * 3 } else { d as u32 })
        .sum();
    sum % 10 == 0
}

fn to_text(digits: &[u8]) -> String {
    digits.iter().map(|d| char::from(b'0' + d)).collect()
}
