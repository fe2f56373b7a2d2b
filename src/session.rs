//! 识别会话：状态机、配置、后台处理线程和回调
//!
//! 帧通过容量为 1 的队列交给处理线程，队列已满时旧帧被丢弃，新帧入队；
//! 识别结果通过另一个线程按帧的处理顺序通知给回调

use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded, unbounded};
use image::{DynamicImage, GrayImage};
use log::{LevelFilter, debug, info, warn};
use serde::Serialize;

use crate::barcode::{self, Roi, RoiSet};
use crate::config::{EngineConfig, SearchMode};
use crate::error::{Result, VsError};
use crate::frame::{BgraFrame, Frame, YuvFrame, prepare_image};
use crate::index::ImageIndex;
use crate::matcher;
use crate::metrics::{self, FrameOutcome};
use crate::motion::{MotionGate, MotionSample};
use crate::orb::{ORBDetector, OrbOptions};
use crate::types::{ImageId, MatchResult, Rect};

/// 授权校验，由调用方实现
pub trait KeyValidator {
    fn validate(&self, key: &str) -> bool;
}

/// 根据 URL 下载图片数据，由调用方实现
pub trait ImageFetcher {
    fn fetch(&self, url: &str) -> anyhow::Result<Vec<u8>>;
}

/// 保存处理过的帧，用于调试
pub trait FrameSink: Send + Sync {
    fn save(&self, frame: &GrayImage) -> Result<()>;
}

/// 图片匹配回调，所有方法默认什么都不做
pub trait ImageMatchObserver: Send {
    fn image_matched(&mut self, _id: ImageId) {}
}

/// 条码识别回调，所有方法默认什么都不做
pub trait CodeMatchObserver: Send {
    /// 只有一个 ROI 或没有 ROI 时识别成功
    fn single_code_matched(&mut self, _text: &str) {}

    /// 识别成功的 ROI，按注册顺序排列
    fn multiple_codes_matched(&mut self, _rois: &[Roi]) {}
}

/// 将帧保存为 PNG 文件，文件名为像素数据的 blake3 哈希
#[derive(Debug, Clone)]
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl FrameSink for DirectorySink {
    fn save(&self, frame: &GrayImage) -> Result<()> {
        let hash = blake3::hash(frame.as_raw());
        let path = self.dir.join(format!("{}.png", hash.to_hex()));
        if !path.exists() {
            frame.save(&path)?;
            debug!("保存帧: {}", path.display());
        }
        Ok(())
    }
}

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Uninitialized,
    /// 授权校验通过
    Configured,
    /// 已经提交过帧
    Running,
}

/// 帧统计，会话结束后 processed + dropped + suppressed + skipped == submitted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub submitted: u64,
    pub processed: u64,
    /// 被更新的帧替换
    pub dropped: u64,
    /// 被运动检测过滤
    pub suppressed: u64,
    /// 处理出错
    pub skipped: u64,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    processed: AtomicU64,
    dropped: AtomicU64,
    suppressed: AtomicU64,
    skipped: AtomicU64,
}

impl Counters {
    fn inc(&self, outcome: FrameOutcome) {
        let counter = match outcome {
            FrameOutcome::Processed => &self.processed,
            FrameOutcome::Dropped => &self.dropped,
            FrameOutcome::Suppressed => &self.suppressed,
            FrameOutcome::Skipped => &self.skipped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        metrics::inc_frame_count(outcome);
    }

    fn snapshot(&self) -> SessionStats {
        SessionStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            suppressed: self.suppressed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }
}

/// 一个回调及其版本号，每次替换回调时版本号加一
struct Slot<O: ?Sized> {
    observer: Option<Box<O>>,
    version: u64,
}

impl<O: ?Sized> Default for Slot<O> {
    fn default() -> Self {
        Self { observer: None, version: 0 }
    }
}

impl<O: ?Sized> Slot<O> {
    fn set(&mut self, observer: Option<Box<O>>) {
        self.observer = observer;
        self.version += 1;
    }
}

#[derive(Default)]
struct Observers {
    image: Slot<dyn ImageMatchObserver>,
    code: Slot<dyn CodeMatchObserver>,
}

#[derive(Debug)]
enum Event {
    ImageMatched(ImageId),
    SingleCode(String),
    MultipleCodes(Vec<Roi>),
}

/// 提交给处理线程的任务，配置和 ROI 在提交时确定
struct Job {
    frame: Frame,
    persist: bool,
    config: Arc<EngineConfig>,
    rois: Vec<Rect>,
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct SessionBuilder {
    config: EngineConfig,
    orb: OrbOptions,
    sink: Option<Arc<dyn FrameSink>>,
    observers: Observers,
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            orb: OrbOptions::default(),
            sink: None,
            observers: Observers::default(),
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn orb(mut self, orb: OrbOptions) -> Self {
        self.orb = orb;
        self
    }

    pub fn frame_sink(mut self, sink: impl FrameSink + 'static) -> Self {
        self.sink = Some(Arc::new(sink));
        self
    }

    pub fn image_observer(mut self, observer: impl ImageMatchObserver + 'static) -> Self {
        self.observers.image.set(Some(Box::new(observer)));
        self
    }

    pub fn code_observer(mut self, observer: impl CodeMatchObserver + 'static) -> Self {
        self.observers.code.set(Some(Box::new(observer)));
        self
    }

    /// 检查配置并启动处理线程和回调线程
    pub fn build(self) -> Result<Session> {
        self.config.validate()?;

        let (frame_tx, frame_rx) = bounded::<Job>(1);
        let (event_tx, event_rx) = unbounded::<Event>();

        let index = Arc::new(ImageIndex::new());
        let detector = Arc::new(ORBDetector::create(self.orb));
        let rois = Arc::new(Mutex::new(RoiSet::new()));
        let motion = Arc::new(Mutex::new(MotionGate::new()));
        let observers = Arc::new(Mutex::new(self.observers));
        let counters = Arc::new(Counters::default());

        let worker = Worker {
            index: index.clone(),
            detector: detector.clone(),
            rois: rois.clone(),
            motion: motion.clone(),
            sink: self.sink,
            counters: counters.clone(),
            events: event_tx,
        };
        let rx = frame_rx.clone();
        let worker = thread::Builder::new().name("vsearch-worker".into()).spawn(move || worker.run(rx))?;

        let delivery_observers = observers.clone();
        let delivery = thread::Builder::new()
            .name("vsearch-delivery".into())
            .spawn(move || deliver(event_rx, delivery_observers))?;

        info!("会话已创建");
        Ok(Session {
            state: Mutex::new(SessionState::Uninitialized),
            config: RwLock::new(Arc::new(self.config)),
            index,
            detector,
            rois,
            motion,
            observers,
            counters,
            frame_tx: Some(frame_tx),
            frame_rx,
            worker: Some(worker),
            delivery: Some(delivery),
        })
    }
}

/// 识别会话
///
/// 除了需要初始化的操作之外，所有方法都可以在任何状态下调用
pub struct Session {
    state: Mutex<SessionState>,
    config: RwLock<Arc<EngineConfig>>,
    index: Arc<ImageIndex>,
    detector: Arc<ORBDetector>,
    rois: Arc<Mutex<RoiSet>>,
    motion: Arc<Mutex<MotionGate>>,
    observers: Arc<Mutex<Observers>>,
    counters: Arc<Counters>,
    frame_tx: Option<Sender<Job>>,
    /// 用于在队列已满时取出旧帧
    frame_rx: Receiver<Job>,
    worker: Option<JoinHandle<()>>,
    delivery: Option<JoinHandle<()>>,
}

impl Session {
    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    /// 校验授权，通过后进入 Configured 状态
    pub fn init_with_key(&self, key: &str, validator: &dyn KeyValidator) -> Result<()> {
        if !validator.validate(key) {
            warn!("授权校验失败");
            return Err(VsError::LicenseRejected);
        }
        let mut state = lock(&self.state);
        if *state == SessionState::Uninitialized {
            *state = SessionState::Configured;
            info!("授权校验通过");
        }
        Ok(())
    }

    fn ensure_initialized(&self) -> Result<()> {
        match self.state() {
            SessionState::Uninitialized => Err(VsError::NotInitialized),
            _ => Ok(()),
        }
    }

    /// 打开或关闭调试日志
    pub fn set_debug(&self, debug: bool) {
        log::set_max_level(if debug { LevelFilter::Debug } else { LevelFilter::Info });
    }

    // ---- 配置 ----

    /// 当前配置的快照
    pub fn config(&self) -> Arc<EngineConfig> {
        self.config.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// 替换整个配置，只影响之后提交的帧
    pub fn apply_config(&self, config: EngineConfig) -> Result<()> {
        self.update_config(|c| *c = config)
    }

    /// 修改配置，新配置无效或已注册的 ROI 超出新的相机输出范围时保持原配置
    ///
    /// 先持有配置锁再持有 ROI 锁，与 add_roi 的加锁顺序一致
    fn update_config(&self, f: impl FnOnce(&mut EngineConfig)) -> Result<()> {
        let mut guard = self.config.write().unwrap_or_else(PoisonError::into_inner);
        let mut config = EngineConfig::clone(&guard);
        f(&mut config);
        config.validate()?;
        let (width, height) = config.capture_size;
        if let Some(roi) = lock(&self.rois).as_slice().iter().find(|roi| !roi.rect.fits_in(width, height)) {
            return Err(VsError::InvalidConfig(format!("ROI {:?} 超出 {width}x{height} 的范围", roi.rect)));
        }
        debug!("更新配置: {config:?}");
        *guard = Arc::new(config);
        Ok(())
    }

    pub fn set_search_mode(&self, mode: SearchMode) -> Result<()> {
        self.update_config(|c| c.search_mode = mode)
    }

    pub fn set_crop_rect(&self, rect: Rect) -> Result<()> {
        self.update_config(|c| c.crop_rect = rect)
    }

    pub fn set_frame_size(&self, size: u32) -> Result<()> {
        self.update_config(|c| c.frame_size = size)
    }

    pub fn set_matching_threshold(&self, threshold: u8) -> Result<()> {
        self.update_config(|c| c.matching_threshold = threshold)
    }

    pub fn set_min_features(&self, n: usize) -> Result<()> {
        self.update_config(|c| c.min_features = n)
    }

    pub fn set_max_features(&self, n: usize) -> Result<()> {
        self.update_config(|c| c.max_features = n)
    }

    pub fn set_capture_size(&self, width: u32, height: u32) -> Result<()> {
        self.update_config(|c| c.capture_size = (width, height))
    }

    // ---- ROI ----

    pub fn add_roi(&self, rect: Rect) -> Result<()> {
        let config = self.config.read().unwrap_or_else(PoisonError::into_inner);
        lock(&self.rois).add(rect, config.capture_size)
    }

    pub fn clear_rois(&self) {
        lock(&self.rois).clear();
    }

    /// 已注册的 ROI 及最近一次的识别结果
    pub fn rois(&self) -> Vec<Roi> {
        lock(&self.rois).as_slice().to_vec()
    }

    // ---- 运动检测 ----

    pub fn enable_motion_filter(&self) -> Result<()> {
        self.update_config(|c| c.motion_filter = true)
    }

    pub fn disable_motion_filter(&self) -> Result<()> {
        lock(&self.motion).reset();
        self.update_config(|c| c.motion_filter = false)
    }

    pub fn push_motion_sample(&self, sample: MotionSample) {
        lock(&self.motion).push_sample(sample);
    }

    // ---- 回调 ----

    pub fn set_image_observer(&self, observer: Option<Box<dyn ImageMatchObserver>>) {
        lock(&self.observers).image.set(observer);
    }

    pub fn set_code_observer(&self, observer: Option<Box<dyn CodeMatchObserver>>) {
        lock(&self.observers).code.set(observer);
    }

    // ---- 图库 ----

    fn extract(&self, image: &DynamicImage, config: &EngineConfig) -> Result<crate::orb::Extraction> {
        let gray = prepare_image(&image.to_luma8(), config)?;
        Ok(self.detector.extract(&gray, config))
    }

    /// 加入图库，自动分配 ID
    pub fn insert_image(&self, image: &DynamicImage) -> Result<ImageId> {
        self.insert(image, None)
    }

    /// 用指定 ID 加入图库
    pub fn insert_image_with_id(&self, image: &DynamicImage, id: ImageId) -> Result<()> {
        self.insert(image, Some(id)).map(|_| ())
    }

    pub fn insert_image_from_url(&self, url: &str, fetcher: &dyn ImageFetcher) -> Result<ImageId> {
        self.ensure_initialized()?;
        let image = fetch_image(url, fetcher)?;
        self.insert(&image, None)
    }

    pub fn insert_image_from_url_with_id(&self, url: &str, id: ImageId, fetcher: &dyn ImageFetcher) -> Result<()> {
        self.ensure_initialized()?;
        let image = fetch_image(url, fetcher)?;
        self.insert(&image, Some(id)).map(|_| ())
    }

    fn insert(&self, image: &DynamicImage, id: Option<ImageId>) -> Result<ImageId> {
        self.ensure_initialized()?;
        let config = self.config();
        let extraction = self.extract(image, &config)?;
        let id = self.index.insert(extraction, id, &config)?;
        metrics::set_pool_images(self.index.len());
        info!("图片 {id} 已加入图库");
        Ok(id)
    }

    pub fn delete_image(&self, id: ImageId) -> Result<()> {
        self.ensure_initialized()?;
        self.index.delete(id)?;
        metrics::set_pool_images(self.index.len());
        Ok(())
    }

    pub fn delete_all_images(&self) -> Result<()> {
        self.ensure_initialized()?;
        self.index.clear();
        metrics::set_pool_images(0);
        Ok(())
    }

    /// 图库中所有图片的 ID
    pub fn image_ids(&self) -> Vec<ImageId> {
        self.index.ids()
    }

    /// 计算图片的质量评分，特征点不足时为 0
    pub fn image_score(&self, image: &DynamicImage) -> Result<u8> {
        self.ensure_initialized()?;
        let config = self.config();
        Ok(self.extract(image, &config)?.score)
    }

    /// 同步搜索一张图片，返回评分超过阈值的最佳匹配
    pub fn search_image(&self, image: &DynamicImage) -> Result<Option<MatchResult>> {
        self.ensure_initialized()?;
        let config = self.config();
        let extraction = self.extract(image, &config)?;
        Ok(matcher::best_match(&self.index.snapshot(), &extraction.descriptors, &config))
    }

    /// 同步计算图片与图库中每张候选图片的评分，按评分降序排列
    pub fn rank_image(&self, image: &DynamicImage) -> Result<Vec<MatchResult>> {
        self.ensure_initialized()?;
        let config = self.config();
        let extraction = self.extract(image, &config)?;
        Ok(matcher::rank(&self.index.snapshot(), &extraction.descriptors, &config))
    }

    // ---- 帧处理 ----

    pub fn process_image(&self, image: &DynamicImage, persist: bool) -> Result<()> {
        self.submit(Frame::Image(image.clone()), persist)
    }

    pub fn process_yuv(&self, frame: YuvFrame, persist: bool) -> Result<()> {
        self.submit(Frame::Yuv(frame), persist)
    }

    pub fn process_bgra(&self, frame: BgraFrame, persist: bool) -> Result<()> {
        self.submit(Frame::Bgra(frame), persist)
    }

    /// 提交一帧，不会等待处理完成
    ///
    /// 队列中已有未处理的帧时，旧帧被丢弃
    fn submit(&self, frame: Frame, persist: bool) -> Result<()> {
        {
            let mut state = lock(&self.state);
            match *state {
                SessionState::Uninitialized => return Err(VsError::NotInitialized),
                SessionState::Configured => *state = SessionState::Running,
                SessionState::Running => {}
            }
        }
        let Some(tx) = &self.frame_tx else {
            return Err(VsError::NotInitialized);
        };

        let mut job = Job { frame, persist, config: self.config(), rois: lock(&self.rois).rects() };
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        loop {
            match tx.try_send(job) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(j)) => {
                    job = j;
                    if self.frame_rx.try_recv().is_ok() {
                        debug!("丢弃未处理的旧帧");
                        self.counters.inc(FrameOutcome::Dropped);
                    }
                }
                Err(TrySendError::Disconnected(_)) => {
                    warn!("处理线程已退出，丢弃帧");
                    self.counters.inc(FrameOutcome::Dropped);
                    return Ok(());
                }
            }
        }
    }

    /// 当前的帧统计
    pub fn stats(&self) -> SessionStats {
        self.counters.snapshot()
    }

    /// 处理完队列中剩余的帧，等待所有回调完成后结束会话
    pub fn shutdown(mut self) -> SessionStats {
        self.stop();
        self.counters.snapshot()
    }

    fn stop(&mut self) {
        // 关闭发送端后，处理线程处理完剩余的帧就会退出，随后回调线程也会退出
        self.frame_tx.take();
        for handle in [self.worker.take(), self.delivery.take()].into_iter().flatten() {
            if handle.join().is_err() {
                warn!("后台线程异常退出");
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop();
    }
}

fn fetch_image(url: &str, fetcher: &dyn ImageFetcher) -> Result<DynamicImage> {
    debug!("下载图片: {url}");
    let data = fetcher.fetch(url).map_err(VsError::Fetch)?;
    Ok(image::load_from_memory(&data)?)
}

struct Worker {
    index: Arc<ImageIndex>,
    detector: Arc<ORBDetector>,
    rois: Arc<Mutex<RoiSet>>,
    motion: Arc<Mutex<MotionGate>>,
    sink: Option<Arc<dyn FrameSink>>,
    counters: Arc<Counters>,
    events: Sender<Event>,
}

impl Worker {
    fn run(self, rx: Receiver<Job>) {
        while let Ok(job) = rx.recv() {
            if job.config.motion_filter && lock(&self.motion).should_suppress() {
                debug!("设备晃动，跳过当前帧");
                self.counters.inc(FrameOutcome::Suppressed);
                continue;
            }
            match panic::catch_unwind(AssertUnwindSafe(|| self.process(&job))) {
                Ok(Ok(events)) => {
                    self.counters.inc(FrameOutcome::Processed);
                    for event in events {
                        // 回调线程只会在本线程退出后退出
                        let _ = self.events.send(event);
                    }
                }
                Ok(Err(e)) => {
                    warn!("处理帧失败: {e}");
                    self.counters.inc(FrameOutcome::Skipped);
                }
                Err(_) => {
                    warn!("处理帧时发生 panic，跳过当前帧");
                    self.counters.inc(FrameOutcome::Skipped);
                }
            }
        }
        debug!("处理线程退出");
    }

    fn process(&self, job: &Job) -> Result<Vec<Event>> {
        let config = &job.config;
        let luma = job.frame.to_luma()?;
        let mut events = vec![];

        if config.search_mode.images() || job.persist {
            let prepared = prepare_image(&luma, config)?;
            if job.persist {
                if let Some(sink) = &self.sink {
                    if let Err(e) = sink.save(&prepared) {
                        warn!("保存帧失败: {e}");
                    }
                }
            }
            if config.search_mode.images() {
                let extraction = self.detector.extract(&prepared, config);
                let snapshot = self.index.snapshot();
                if let Some(result) = matcher::best_match(&snapshot, &extraction.descriptors, config) {
                    debug!("匹配到图片 {}，评分 {:.2}", result.id, result.score);
                    events.push(Event::ImageMatched(result.id));
                }
            }
        }

        if config.search_mode.codes() {
            events.extend(self.decode_codes(&luma, &job.rois));
        }
        Ok(events)
    }

    fn decode_codes(&self, luma: &GrayImage, rects: &[Rect]) -> Vec<Event> {
        if rects.is_empty() {
            return barcode::decode(luma)
                .map(|decoded| {
                    metrics::inc_decoded_codes(decoded.symbology.as_str());
                    Event::SingleCode(decoded.text)
                })
                .into_iter()
                .collect();
        }

        let results = barcode::decode_rois(luma, rects);
        lock(&self.rois).record(&results);
        let found = results.into_iter().filter(|roi| roi.decoded.is_some()).collect::<Vec<_>>();
        for roi in &found {
            if let Some(symbology) = roi.symbology {
                metrics::inc_decoded_codes(symbology.as_str());
            }
        }

        let mut events = vec![];
        if rects.len() == 1 {
            if let Some(text) = found.first().and_then(|roi| roi.decoded.clone()) {
                events.push(Event::SingleCode(text));
            }
        }
        if !found.is_empty() {
            events.push(Event::MultipleCodes(found));
        }
        events
    }
}

fn deliver(rx: Receiver<Event>, observers: Arc<Mutex<Observers>>) {
    for event in rx {
        match event {
            Event::ImageMatched(id) => notify(&observers, |o| &mut o.image, |observer| observer.image_matched(id)),
            Event::SingleCode(text) => {
                notify(&observers, |o| &mut o.code, |observer| observer.single_code_matched(&text))
            }
            Event::MultipleCodes(rois) => {
                notify(&observers, |o| &mut o.code, |observer| observer.multiple_codes_matched(&rois))
            }
        }
    }
    debug!("回调线程退出");
}

/// 取出回调后释放锁再调用，回调中可以替换或注销自己
///
/// 调用期间回调被替换时，旧回调不再放回
fn notify<O: ?Sized>(
    observers: &Mutex<Observers>,
    slot: impl Fn(&mut Observers) -> &mut Slot<O>,
    f: impl FnOnce(&mut O),
) {
    let (mut observer, version) = {
        let mut guard = lock(observers);
        let slot = slot(&mut *guard);
        match slot.observer.take() {
            Some(observer) => (observer, slot.version),
            None => return,
        }
    };
    f(observer.as_mut());
    let mut guard = lock(observers);
    let slot = slot(&mut *guard);
    if slot.version == version {
        slot.observer = Some(observer);
    }
}
