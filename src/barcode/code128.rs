//! Code 128 扫描线解码，支持 A / B / C 三种字符集

use super::{Decoded, QUIET_MODULES, Run, Symbology, bar_starts, closest_pattern};

/// 单个符号与理想宽度的最大允许误差，单位为模块
const MAX_SYMBOL_ERROR: f32 = 1.2;
/// 结束符之后至少需要的留白模块数
const TRAILING_QUIET: f32 = 5.0;
/// 每个符号的游程数和模块数
const SYMBOL_RUNS: usize = 6;
const SYMBOL_MODULES: u32 = 11;

const SHIFT: u8 = 98;
const CODE_C: u8 = 99;
const CODE_B: u8 = 100;
const CODE_A: u8 = 101;
const START_A: u8 = 103;
const START_B: u8 = 104;
const START_C: u8 = 105;

/// 结束符，依次为 条 空 条 空 条 空 条
const STOP: [[u8; 7]; 1] = [[2, 3, 3, 1, 1, 1, 2]];

/// 符号值 0..=105 的模块宽度，依次为 条 空 条 空 条 空
const PATTERNS: [[u8; 6]; 106] = [
    [2, 1, 2, 2, 2, 2], [2, 2, 2, 1, 2, 2], [2, 2, 2, 2, 2, 1], [1, 2, 1, 2, 2, 3], [1, 2, 1, 3, 2, 2],
    [1, 3, 1, 2, 2, 2], [1, 2, 2, 2, 1, 3], [1, 2, 2, 3, 1, 2], [1, 3, 2, 2, 1, 2], [2, 2, 1, 2, 1, 3],
    [2, 2, 1, 3, 1, 2], [2, 3, 1, 2, 1, 2], [1, 1, 2, 2, 3, 2], [1, 2, 2, 1, 3, 2], [1, 2, 2, 2, 3, 1],
    [1, 1, 3, 2, 2, 2], [1, 2, 3, 1, 2, 2], [1, 2, 3, 2, 2, 1], [2, 2, 3, 2, 1, 1], [2, 2, 1, 1, 3, 2],
    [2, 2, 1, 2, 3, 1], [2, 1, 3, 2, 1, 2], [2, 2, 3, 1, 1, 2], [3, 1, 2, 1, 3, 1], [3, 1, 1, 2, 2, 2],
    [3, 2, 1, 1, 2, 2], [3, 2, 1, 2, 2, 1], [3, 1, 2, 2, 1, 2], [3, 2, 2, 1, 1, 2], [3, 2, 2, 2, 1, 1],
    [2, 1, 2, 1, 2, 3], [2, 1, 2, 3, 2, 1], [2, 3, 2, 1, 2, 1], [1, 1, 1, 3, 2, 3], [1, 3, 1, 1, 2, 3],
    [1, 3, 1, 3, 2, 1], [1, 1, 2, 3, 1, 3], [1, 3, 2, 1, 1, 3], [1, 3, 2, 3, 1, 1], [2, 1, 1, 3, 1, 3],
    [2, 3, 1, 1, 1, 3], [2, 3, 1, 3, 1, 1], [1, 1, 2, 1, 3, 3], [1, 1, 2, 3, 3, 1], [1, 3, 2, 1, 3, 1],
    [1, 1, 3, 1, 2, 3], [1, 1, 3, 3, 2, 1], [1, 3, 3, 1, 2, 1], [3, 1, 3, 1, 2, 1], [2, 1, 1, 3, 3, 1],
    [2, 3, 1, 1, 3, 1], [2, 1, 3, 1, 1, 3], [2, 1, 3, 3, 1, 1], [2, 1, 3, 1, 3, 1], [3, 1, 1, 1, 2, 3],
    [3, 1, 1, 3, 2, 1], [3, 3, 1, 1, 2, 1], [3, 1, 2, 1, 1, 3], [3, 1, 2, 3, 1, 1], [3, 3, 2, 1, 1, 1],
    [3, 1, 4, 1, 1, 1], [2, 2, 1, 4, 1, 1], [4, 3, 1, 1, 1, 1], [1, 1, 1, 2, 2, 4], [1, 1, 1, 4, 2, 2],
    [1, 2, 1, 1, 2, 4], [1, 2, 1, 4, 2, 1], [1, 4, 1, 1, 2, 2], [1, 4, 1, 2, 2, 1], [1, 1, 2, 2, 1, 4],
    [1, 1, 2, 4, 1, 2], [1, 2, 2, 1, 1, 4], [1, 2, 2, 4, 1, 1], [1, 4, 2, 1, 1, 2], [1, 4, 2, 2, 1, 1],
    [2, 4, 1, 2, 1, 1], [2, 2, 1, 1, 1, 4], [4, 1, 3, 1, 1, 1], [2, 4, 1, 1, 1, 2], [1, 3, 4, 1, 1, 1],
    [1, 1, 1, 2, 4, 2], [1, 2, 1, 1, 4, 2], [1, 2, 1, 2, 4, 1], [1, 1, 4, 2, 1, 2], [1, 2, 4, 1, 1, 2],
    [1, 2, 4, 2, 1, 1], [4, 1, 1, 2, 1, 2], [4, 2, 1, 1, 1, 2], [4, 2, 1, 2, 1, 1], [2, 1, 2, 1, 4, 1],
    [2, 1, 4, 1, 2, 1], [4, 1, 2, 1, 2, 1], [1, 1, 1, 1, 4, 3], [1, 1, 1, 3, 4, 1], [1, 3, 1, 1, 4, 1],
    [1, 1, 4, 1, 1, 3], [1, 1, 4, 3, 1, 1], [4, 1, 1, 1, 1, 3], [4, 1, 1, 3, 1, 1], [1, 1, 3, 1, 4, 1],
    [1, 1, 4, 1, 3, 1], [3, 1, 1, 1, 4, 1], [4, 1, 1, 1, 3, 1], [2, 1, 1, 4, 1, 2], [2, 1, 1, 2, 1, 4],
    [2, 1, 1, 2, 3, 2],
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CodeSet {
    A,
    B,
    C,
}

pub(super) fn decode_runs(runs: &[Run]) -> Option<Decoded> {
    bar_starts(runs).find_map(|start| decode_at(runs, start))
}

fn decode_at(runs: &[Run], start: usize) -> Option<Decoded> {
    let (first, module) = read_symbol(runs, start)?;
    if !(START_A..=START_C).contains(&first) {
        return None;
    }
    if (runs[start - 1].len as f32) < module * QUIET_MODULES {
        return None;
    }

    let mut values = vec![];
    let mut pos = start + SYMBOL_RUNS;
    while !is_stop(runs, pos, module) {
        let (value, width) = read_symbol(runs, pos)?;
        // 模块宽度明显变化说明已经离开了条码
        if value >= START_A || !(0.75..=1.25).contains(&(width / module)) {
            return None;
        }
        values.push(value);
        pos += SYMBOL_RUNS;
    }

    let (&check, data) = values.split_last()?;
    if data.is_empty() {
        return None;
    }
    let sum = data.iter().enumerate().fold(first as u32, |acc, (i, &v)| acc + (i as u32 + 1) * v as u32);
    if sum % 103 != check as u32 {
        return None;
    }
    let text = to_text(first, data);
    (!text.is_empty()).then_some(Decoded { text, symbology: Symbology::Code128 })
}

/// 读取 runs[pos] 开始的一个符号，返回 (符号值, 模块宽度)
fn read_symbol(runs: &[Run], pos: usize) -> Option<(u8, f32)> {
    let symbol = runs.get(pos..pos + SYMBOL_RUNS)?;
    if !symbol[0].bar {
        return None;
    }
    let (value, error) = closest_pattern(symbol, &PATTERNS, SYMBOL_MODULES)?;
    let module = symbol.iter().map(|r| r.len).sum::<u32>() as f32 / SYMBOL_MODULES as f32;
    (error <= MAX_SYMBOL_ERROR).then_some((value as u8, module))
}

fn is_stop(runs: &[Run], pos: usize, module: f32) -> bool {
    let Some(symbol) = runs.get(pos..pos + STOP[0].len()) else {
        return false;
    };
    let Some((_, error)) = closest_pattern(symbol, &STOP, 13) else {
        return false;
    };
    let trailing_ok = runs.get(pos + STOP[0].len()).is_none_or(|r| r.len as f32 >= module * TRAILING_QUIET);
    symbol[0].bar && error <= MAX_SYMBOL_ERROR && trailing_ok
}

/// 按字符集把数据符号转换为文本，功能字符（FNC1 等）不输出
fn to_text(start: u8, data: &[u8]) -> String {
    let mut set = match start {
        START_A => CodeSet::A,
        START_B => CodeSet::B,
        _ => CodeSet::C,
    };
    let mut shift = false;
    let mut text = String::new();
    for &v in data {
        let current = match (shift, set) {
            (true, CodeSet::A) => CodeSet::B,
            (true, CodeSet::B) => CodeSet::A,
            _ => set,
        };
        shift = false;
        match (current, v) {
            (CodeSet::C, 0..=99) => {
                text.push(char::from(b'0' + v / 10));
                text.push(char::from(b'0' + v % 10));
            }
            (CodeSet::A, 0..=63) | (CodeSet::B, 0..=95) => text.push(char::from(v + 32)),
            (CodeSet::A, 64..=95) => text.push(char::from(v - 64)),
            (CodeSet::A | CodeSet::B, SHIFT) => shift = true,
            (CodeSet::A | CodeSet::B, CODE_C) => set = CodeSet::C,
            (CodeSet::A | CodeSet::C, CODE_B) => set = CodeSet::B,
            (CodeSet::B | CodeSet::C, CODE_A) => set = CodeSet::A,
            _ => {}
        }
    }
    text
}
