//! 测试共用的图片生成函数
//!
//! 集成测试通过 `#[path]` 引入本文件，因此这里只依赖外部 crate

use image::{GrayImage, Luma};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// 生成带有随机矩形和少量噪声的测试图片
pub fn textured_image(w: u32, h: u32, seed: u64) -> GrayImage {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut img = GrayImage::from_pixel(w, h, Luma([128]));
    for _ in 0..60 {
        let rw = rng.random_range(8..40);
        let rh = rng.random_range(8..40);
        let x0 = rng.random_range(0..w - rw);
        let y0 = rng.random_range(0..h - rh);
        let v = rng.random_range(0..=255u8);
        for y in y0..y0 + rh {
            for x in x0..x0 + rw {
                img.put_pixel(x, y, Luma([v]));
            }
        }
    }
    for p in img.pixels_mut() {
        let noise = rng.random_range(-6i32..=6);
        p[0] = (p[0] as i32 + noise).clamp(0, 255) as u8;
    }
    img
}

/// 左侧 L 组编码，1 表示条
const L_CODES: [&str; 10] = [
    "0001101", "0011001", "0010011", "0111101", "0100011", "0110001", "0101111", "0111011", "0110111", "0001011",
];
const G_CODES: [&str; 10] = [
    "0100111", "0110011", "0011011", "0100001", "0011101", "0111001", "0000101", "0010001", "0001001", "0010111",
];
const R_CODES: [&str; 10] = [
    "1110010", "1100110", "1101100", "1000010", "1011100", "1001110", "1010000", "1000100", "1001000", "1110100",
];

/// EAN-13 首位数字对应的左半部分编码组
const EAN13_PARITY: [&str; 10] = [
    "LLLLLL", "LLGLGG", "LLGGLG", "LLGGGL", "LGLLGG", "LGGLLG", "LGGGLL", "LGLGLG", "LGLGGL", "LGGLGL",
];
/// UPC-E 数制 0 下校验位对应的编码组，数制 1 时 L 与 G 互换
const UPCE_PARITY: [&str; 10] = [
    "GGGLLL", "GGLGLL", "GGLLGL", "GGLLLG", "GLGGLL", "GLLGGL", "GLLLGG", "GLGLGL", "GLGLLG", "GLLGLG",
];

fn digits(code: &str) -> Vec<usize> {
    code.bytes().map(|b| (b - b'0') as usize).collect()
}

/// EAN-13 / EAN-8 的模块序列，code 需要包含校验位
pub fn ean_modules(code: &str) -> String {
    let digits = digits(code);
    let (parity, rest) = match digits.len() {
        13 => (EAN13_PARITY[digits[0]], &digits[1..]),
        8 => ("LLLL", &digits[..]),
        n => panic!("unsupported code length {n}"),
    };
    let half = rest.len() / 2;

    let mut modules = String::from("101");
    for (&d, group) in rest[..half].iter().zip(parity.chars()) {
        modules += if group == 'G' { G_CODES[d] } else { L_CODES[d] };
    }
    modules += "01010";
    for &d in &rest[half..] {
        modules += R_CODES[d];
    }
    modules += "101";
    modules
}

/// UPC-E 的模块序列，code 为 8 位：数制、6 位数字、校验位
pub fn upce_modules(code: &str) -> String {
    let digits = digits(code);
    assert_eq!(digits.len(), 8, "unsupported code length");
    let (system, check) = (digits[0], digits[7]);

    let mut modules = String::from("101");
    for (&d, group) in digits[1..7].iter().zip(UPCE_PARITY[check].chars()) {
        let use_g = (group == 'G') == (system == 0);
        modules += if use_g { G_CODES[d] } else { L_CODES[d] };
    }
    modules += "010101";
    modules
}

/// 绘制模块序列，'1' 为条，两侧各留 10 个模块的空白
pub fn render_modules(modules: &str, module_px: u32) -> GrayImage {
    let modules = modules.as_bytes();
    let quiet = 10;
    let width = (modules.len() as u32 + 2 * quiet) * module_px;
    GrayImage::from_fn(width, 40, |x, _| {
        let m = (x / module_px).checked_sub(quiet).map(|i| i as usize);
        match m.and_then(|i| modules.get(i)) {
            Some(b'1') => Luma([20]),
            _ => Luma([235]),
        }
    })
}

/// 绘制理想的 EAN-13 / EAN-8 条码
pub fn render_ean(code: &str, module_px: u32) -> GrayImage {
    render_modules(&ean_modules(code), module_px)
}

/// 绘制理想的 UPC-E 条码
pub fn render_upce(code: &str, module_px: u32) -> GrayImage {
    render_modules(&upce_modules(code), module_px)
}
