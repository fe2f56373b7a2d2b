mod common;

use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use common::{render_ean, textured_image};
use image::{DynamicImage, GrayImage, ImageFormat, Luma, imageops};
use rstest::*;
use vsearch::barcode::Roi;
use vsearch::frame::{BgraFrame, YuvFrame, YuvRange};
use vsearch::session::{CodeMatchObserver, ImageFetcher, ImageMatchObserver, KeyValidator, SessionState};
use vsearch::types::{ImageId, Rect};
use vsearch::{EngineConfig, SearchMode, Session, VsError};

struct AcceptAll;

impl KeyValidator for AcceptAll {
    fn validate(&self, _key: &str) -> bool {
        true
    }
}

#[derive(Clone, Default)]
struct Events(Arc<Mutex<Vec<String>>>);

impl Events {
    fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }

    fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}

/// 等待条件成立，最多 10 秒
fn wait_for(mut done: impl FnMut() -> bool) {
    let start = Instant::now();
    while !done() {
        assert!(start.elapsed() < Duration::from_secs(10), "等待超时");
        thread::sleep(Duration::from_millis(5));
    }
}

/// 只识别条码、回调写入 events 的会话
fn code_session(events: &Events) -> Session {
    let session = Session::builder().code_observer(events.clone()).build().unwrap();
    session.init_with_key("test", &AcceptAll).unwrap();
    session.set_search_mode(SearchMode::Codes).unwrap();
    session
}

/// 返回固定数据的下载器，数据为 None 时下载失败
struct StaticFetcher(Option<Vec<u8>>);

impl ImageFetcher for StaticFetcher {
    fn fetch(&self, url: &str) -> anyhow::Result<Vec<u8>> {
        self.0.clone().ok_or_else(|| anyhow::anyhow!("404: {url}"))
    }
}

impl ImageMatchObserver for Events {
    fn image_matched(&mut self, id: ImageId) {
        self.0.lock().unwrap().push(format!("image:{id}"));
    }
}

impl CodeMatchObserver for Events {
    fn single_code_matched(&mut self, text: &str) {
        self.0.lock().unwrap().push(format!("single:{text}"));
    }

    fn multiple_codes_matched(&mut self, rois: &[Roi]) {
        let texts = rois.iter().filter_map(|roi| roi.decoded.as_deref()).collect::<Vec<_>>();
        self.0.lock().unwrap().push(format!("multiple:{}", texts.join(",")));
    }
}

fn image(seed: u64) -> DynamicImage {
    DynamicImage::ImageLuma8(textured_image(320, 240, seed))
}

/// 已初始化、参数适合测试图片的会话
#[fixture]
fn session() -> Session {
    let session = Session::builder().build().unwrap();
    session.init_with_key("test", &AcceptAll).unwrap();
    session.set_max_features(100).unwrap();
    session.set_min_features(30).unwrap();
    session.set_matching_threshold(2).unwrap();
    session
}

#[rstest]
fn insert_delete_and_search(session: Session) {
    let a = image(1);
    let b = image(2);

    assert_eq!(session.insert_image(&a).unwrap(), 0);
    assert!(matches!(session.insert_image_with_id(&b, 0), Err(VsError::DuplicateId(0))));

    session.delete_image(0).unwrap();
    assert!(matches!(session.delete_image(0), Err(VsError::NotFound(0))));
    session.insert_image_with_id(&b, 0).unwrap();
    assert_eq!(session.image_ids(), vec![0]);

    // A 已被删除，旋转后的 A 不会匹配到 B
    let rotated = DynamicImage::ImageLuma8(imageops::rotate90(&a.to_luma8()));
    assert!(session.search_image(&rotated).unwrap().is_none());

    let result = session.search_image(&b).unwrap().unwrap();
    assert_eq!(result.id, 0);
    assert!(result.score > 2.0);
}

#[rstest]
fn search_after_clear(session: Session) {
    let a = image(3);
    session.insert_image(&a).unwrap();
    assert!(session.search_image(&a).unwrap().is_some());

    session.delete_all_images().unwrap();
    assert!(session.image_ids().is_empty());
    assert!(session.search_image(&a).unwrap().is_none());
    assert!(session.rank_image(&a).unwrap().is_empty());
}

#[rstest]
fn raising_threshold_never_adds_matches(session: Session) {
    let a = image(4);
    session.insert_image(&a).unwrap();

    session.set_matching_threshold(5).unwrap();
    assert!(session.search_image(&a).unwrap().is_some());
    // 评分最高为 10，必须严格大于阈值
    session.set_matching_threshold(10).unwrap();
    assert!(session.search_image(&a).unwrap().is_none());
}

#[rstest]
fn rank_orders_by_score(session: Session) {
    for seed in 10..13 {
        session.insert_image(&image(seed)).unwrap();
    }
    let ranked = session.rank_image(&image(11)).unwrap();
    assert_eq!(ranked[0].id, 1);
    assert!(ranked.windows(2).all(|w| w[0].score >= w[1].score));
}

#[test]
fn requires_initialization() {
    let session = Session::builder().build().unwrap();
    let a = image(1);
    assert!(matches!(session.insert_image(&a), Err(VsError::NotInitialized)));
    assert!(matches!(session.search_image(&a), Err(VsError::NotInitialized)));
    assert!(matches!(session.process_image(&a, false), Err(VsError::NotInitialized)));
    assert!(matches!(session.delete_all_images(), Err(VsError::NotInitialized)));
}

#[rstest]
fn every_frame_is_accounted_for(session: Session) {
    let frame = image(5);
    for _ in 0..40 {
        session.process_image(&frame, false).unwrap();
    }
    let stats = session.shutdown();
    assert_eq!(stats.submitted, 40);
    assert_eq!(stats.processed + stats.dropped + stats.suppressed + stats.skipped, stats.submitted);
    assert!(stats.processed >= 1);
}

#[test]
fn image_observer_receives_match() {
    let events = Events::default();
    let session = Session::builder().image_observer(events.clone()).build().unwrap();
    session.init_with_key("test", &AcceptAll).unwrap();
    session.set_max_features(100).unwrap();
    session.set_min_features(30).unwrap();
    session.set_matching_threshold(2).unwrap();
    session.set_search_mode(SearchMode::Image).unwrap();

    let a = image(6);
    let id = session.insert_image(&a).unwrap();
    session.process_image(&a, false).unwrap();
    session.shutdown();
    assert_eq!(events.take(), vec![format!("image:{id}")]);
}

#[rstest]
fn roi_limits(session: Session) {
    for i in 0..4 {
        session.add_roi(Rect::new(i * 100, 0, 80, 80)).unwrap();
    }
    assert!(matches!(session.add_roi(Rect::new(0, 200, 80, 80)), Err(VsError::InvalidRegion(_))));
    assert_eq!(session.rois().len(), 4);

    session.clear_rois();
    session.add_roi(Rect::new(0, 0, 100, 100)).unwrap();
    assert!(matches!(session.add_roi(Rect::new(50, 50, 100, 100)), Err(VsError::InvalidRegion(_))));
    // 超出相机输出尺寸
    assert!(matches!(session.add_roi(Rect::new(600, 400, 100, 100)), Err(VsError::InvalidRegion(_))));
}

#[test]
fn decodes_code_inside_roi() {
    let events = Events::default();
    let session = Session::builder().code_observer(events.clone()).build().unwrap();
    session.init_with_key("test", &AcceptAll).unwrap();
    session.set_search_mode(SearchMode::Codes).unwrap();

    let code = render_ean("5901234123457", 2);
    let mut frame = GrayImage::from_pixel(code.width() + 100, 200, Luma([235]));
    imageops::overlay(&mut frame, &code, 40, 120);
    session.set_capture_size(frame.width(), frame.height()).unwrap();
    session.add_roi(Rect::new(0, 0, frame.width(), 100)).unwrap();
    session.add_roi(Rect::new(0, 110, frame.width(), 60)).unwrap();

    session.process_image(&DynamicImage::ImageLuma8(frame), false).unwrap();
    session.shutdown();
    // 多个 ROI 时只回调识别成功的区域
    assert_eq!(events.take(), vec!["multiple:5901234123457".to_string()]);
}

#[test]
fn yuv_and_bgra_frames_are_decoded() {
    let events = Events::default();
    let session = code_session(&events);
    let code = render_ean("5901234123457", 2);
    let (w, h) = code.dimensions();

    // 亮度平面每行带 8 字节 padding
    let y_stride = w as usize + 8;
    let mut y_plane = vec![0u8; y_stride * h as usize];
    for (row, src) in y_plane.chunks_mut(y_stride).zip(code.rows()) {
        for (dst, p) in row.iter_mut().zip(src) {
            *dst = p[0];
        }
    }
    let uv_stride = w.div_ceil(2) as usize * 2;
    let uv_plane = vec![128u8; uv_stride * h.div_ceil(2) as usize];
    let yuv = YuvFrame { width: w, height: h, y_plane, y_stride, uv_plane, uv_stride, range: YuvRange::Full };
    session.process_yuv(yuv, false).unwrap();
    wait_for(|| events.len() == 1);

    let data = code.pixels().flat_map(|p| [p[0], p[0], p[0], 255]).collect::<Vec<_>>();
    let bgra = BgraFrame { width: w, height: h, data, stride: w as usize * 4 };
    session.process_bgra(bgra, false).unwrap();

    let stats = session.shutdown();
    assert_eq!(stats.processed, 2);
    assert_eq!(events.take(), vec!["single:5901234123457".to_string(); 2]);
}

#[rstest]
fn malformed_frame_is_skipped(session: Session) {
    let yuv = YuvFrame {
        width: 64,
        height: 64,
        y_plane: vec![0; 100],
        y_stride: 64,
        uv_plane: vec![128; 64 * 32],
        uv_stride: 64,
        range: YuvRange::Video,
    };
    session.process_yuv(yuv, false).unwrap();
    assert_eq!(session.state(), SessionState::Running);
    let stats = session.shutdown();
    assert_eq!(stats.submitted, 1);
    assert_eq!(stats.skipped, 1);
}

#[test]
fn queued_frame_keeps_its_config() {
    let events = Events::default();
    let session = code_session(&events);
    session.process_image(&DynamicImage::ImageLuma8(render_ean("5901234123457", 2)), false).unwrap();
    // 提交之后修改配置不影响已提交的帧
    session.set_search_mode(SearchMode::Image).unwrap();
    let stats = session.shutdown();
    assert_eq!(stats.processed, 1);
    assert_eq!(events.take(), vec!["single:5901234123457".to_string()]);
}

#[rstest]
fn insert_image_from_url(session: Session) {
    let mut png = Cursor::new(vec![]);
    image(7).write_to(&mut png, ImageFormat::Png).unwrap();
    let fetcher = StaticFetcher(Some(png.into_inner()));
    assert_eq!(session.insert_image_from_url("https://example.com/a.png", &fetcher).unwrap(), 0);
    session.insert_image_from_url_with_id("https://example.com/a.png", 9, &fetcher).unwrap();
    assert_eq!(session.image_ids(), vec![0, 9]);

    let missing = StaticFetcher(None);
    assert!(matches!(session.insert_image_from_url("https://example.com/b.png", &missing), Err(VsError::Fetch(_))));
    let garbage = StaticFetcher(Some(b"not an image".to_vec()));
    assert!(matches!(session.insert_image_from_url("https://example.com/c.png", &garbage), Err(VsError::Image(_))));
    assert_eq!(session.image_ids(), vec![0, 9]);
}

#[test]
fn replacing_and_removing_observer() {
    let first = Events::default();
    let session = code_session(&first);
    let frame = DynamicImage::ImageLuma8(render_ean("96385074", 2));

    session.process_image(&frame, false).unwrap();
    wait_for(|| first.len() == 1);

    let second = Events::default();
    session.set_code_observer(Some(Box::new(second.clone())));
    session.process_image(&frame, false).unwrap();
    wait_for(|| second.len() == 1);

    // 没有回调时帧照常处理
    session.set_code_observer(None);
    session.process_image(&frame, false).unwrap();
    let stats = session.shutdown();
    assert_eq!(stats.processed, 3);
    assert_eq!(first.take(), vec!["single:96385074".to_string()]);
    assert_eq!(second.take(), vec!["single:96385074".to_string()]);
}

#[rstest]
fn overflowing_rects_are_rejected(session: Session) {
    let huge = Rect::new(u32::MAX - 5, 0, 10, 10);
    assert!(matches!(session.add_roi(huge), Err(VsError::InvalidRegion(_))));
    assert!(matches!(session.set_crop_rect(huge), Err(VsError::InvalidConfig(_))));
    assert!(session.rois().is_empty());

    session.process_image(&image(8), false).unwrap();
    let stats = session.shutdown();
    assert_eq!(stats.processed, 1);
    assert_eq!(stats.skipped, 0);
}

#[rstest]
fn capture_size_must_contain_rois(session: Session) {
    session.add_roi(Rect::new(500, 400, 100, 80)).unwrap();
    assert!(matches!(session.set_capture_size(100, 100), Err(VsError::InvalidConfig(_))));
    let config = EngineConfig { capture_size: (320, 240), ..EngineConfig::clone(&session.config()) };
    assert!(matches!(session.apply_config(config.clone()), Err(VsError::InvalidConfig(_))));
    assert_eq!(session.config().capture_size, (640, 480));
    assert_eq!(session.rois().len(), 1);

    session.clear_rois();
    session.apply_config(config).unwrap();
    assert_eq!(session.config().capture_size, (320, 240));
    assert!(matches!(session.add_roi(Rect::new(500, 400, 100, 80)), Err(VsError::InvalidRegion(_))));
}
