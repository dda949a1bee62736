//! Attached applications and the shared memory they own

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};
use vnet_session_core::{
    AppCallbacks, AppOptions, CallbackMask, FifoLocation, Result, SegmentInfo, SessionCallbacks,
    SessionError,
};
use vnet_session_shm::{EventQueue, EventQueueManager, EventQueueNotifier, Segment, SegmentManager};

use crate::config::SessionLayerConfig;

/// Published application records, keyed by application index
pub type AppMap = HashMap<u32, Arc<Application>>;

/// An attached application
#[derive(Clone)]
pub struct Application {
    index: u32,
    api_client_index: Option<u32>,
    builtin: bool,
    options: AppOptions,
    rx_fifo_size: u32,
    tx_fifo_size: u32,
    add_segment_size: u64,
    notifier: Arc<dyn SessionCallbacks>,
    /// Primary segment first, added segments after it
    segments: Vec<Arc<Segment>>,
    event_queue: Arc<EventQueue>,
}

impl Application {
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Binary-API client of an external application
    pub fn api_client_index(&self) -> Option<u32> {
        self.api_client_index
    }

    pub fn is_builtin(&self) -> bool {
        self.builtin
    }

    pub fn options(&self) -> &AppOptions {
        &self.options
    }

    pub fn notifier(&self) -> Arc<dyn SessionCallbacks> {
        self.notifier.clone()
    }

    pub fn primary_segment(&self) -> &Arc<Segment> {
        &self.segments[0]
    }

    pub fn segments(&self) -> &[Arc<Segment>] {
        &self.segments
    }

    pub fn event_queue(&self) -> &Arc<EventQueue> {
        &self.event_queue
    }
}

impl std::fmt::Debug for Application {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Application")
            .field("index", &self.index)
            .field("api_client_index", &self.api_client_index)
            .field("builtin", &self.builtin)
            .field("options", &self.options)
            .field("segments", &self.segments)
            .field("event_queue", &self.event_queue)
            .finish()
    }
}

/// Attach request
#[derive(Debug, Clone)]
pub struct AttachArgs {
    pub callbacks: AppCallbacks,
    pub options: AppOptions,
    pub builtin: bool,
}

impl AttachArgs {
    pub fn builtin(callbacks: Arc<dyn SessionCallbacks>, options: AppOptions) -> Self {
        Self {
            callbacks: AppCallbacks::Builtin(callbacks),
            options,
            builtin: true,
        }
    }

    pub fn external(api_client_index: u32, subscribed: CallbackMask, options: AppOptions) -> Self {
        Self {
            callbacks: AppCallbacks::External {
                api_client_index,
                subscribed,
            },
            options,
            builtin: false,
        }
    }
}

/// Attach reply returned to the application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachReply {
    pub app_index: u32,
    pub segment_name: String,
    pub segment_size: u64,
    pub event_queue_address: u64,
}

/// rx/tx FIFO reservation of one session
#[derive(Clone)]
pub struct FifoPlacement {
    segment: Arc<Segment>,
    rx_offset: u64,
    rx_size: u32,
    tx_offset: u64,
    tx_size: u32,
}

impl FifoPlacement {
    fn place(segment: &Arc<Segment>, rx_size: u32, tx_size: u32) -> Option<Self> {
        let rx_offset = segment.allocate(rx_size as u64).ok()?;
        let tx_offset = match segment.allocate(tx_size as u64) {
            Ok(offset) => offset,
            Err(_) => {
                segment.free(rx_offset, rx_size as u64);
                return None;
            }
        };

        Some(Self {
            segment: segment.clone(),
            rx_offset,
            rx_size,
            tx_offset,
            tx_size,
        })
    }

    pub fn location(&self) -> FifoLocation {
        FifoLocation {
            segment_name: self.segment.name().to_string(),
            rx_offset: self.rx_offset,
            rx_size: self.rx_size,
            tx_offset: self.tx_offset,
            tx_size: self.tx_size,
        }
    }

    /// Give the space back to the segment
    pub fn release(self) {
        self.segment.free(self.rx_offset, self.rx_size as u64);
        self.segment.free(self.tx_offset, self.tx_size as u64);
    }
}

impl std::fmt::Debug for FifoPlacement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("FifoPlacement").field(&self.location()).finish()
    }
}

/// Layer-wide defaults applied where an application passed zero
#[derive(Debug, Clone, Copy)]
struct AppDefaults {
    segment_size: u64,
    add_segment_size: u64,
    event_queue_size: u32,
    rx_fifo_size: u32,
    tx_fifo_size: u32,
}

fn or_default<T: PartialEq + Default>(value: T, default: T) -> T {
    if value == T::default() {
        default
    } else {
        value
    }
}

/// Owner of every Application record.
///
/// Mutated only under the control-plane lock. Each change republishes the
/// full map through `published` so dataplane readers never lock.
pub struct ApplicationRegistry {
    defaults: AppDefaults,
    segments: Arc<SegmentManager>,
    queues: Arc<EventQueueManager>,
    apps: AppMap,
    published: Arc<ArcSwap<AppMap>>,
    next_index: u32,
    free_indices: BTreeSet<u32>,
}

impl ApplicationRegistry {
    pub fn new(
        config: &SessionLayerConfig,
        segments: Arc<SegmentManager>,
        queues: Arc<EventQueueManager>,
        published: Arc<ArcSwap<AppMap>>,
    ) -> Self {
        Self {
            defaults: AppDefaults {
                segment_size: config.default_segment_size,
                add_segment_size: config.default_add_segment_size,
                event_queue_size: config.default_event_queue_size,
                rx_fifo_size: config.default_rx_fifo_size,
                tx_fifo_size: config.default_tx_fifo_size,
            },
            segments,
            queues,
            apps: HashMap::new(),
            published,
            next_index: 0,
            free_indices: BTreeSet::new(),
        }
    }

    pub fn get(&self, index: u32) -> Option<&Arc<Application>> {
        self.apps.get(&index)
    }

    pub fn len(&self) -> usize {
        self.apps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }

    fn publish(&self) {
        self.published.store(Arc::new(self.apps.clone()));
    }

    /// Lowest reclaimed index, else the next never-used one
    fn peek_index(&self) -> Result<u32> {
        if let Some(index) = self.free_indices.first() {
            return Ok(*index);
        }
        if self.next_index == u32::MAX {
            return Err(SessionError::ResourceExhausted("application indices exhausted".to_string()));
        }
        Ok(self.next_index)
    }

    fn take_index(&mut self, index: u32) {
        if !self.free_indices.remove(&index) {
            self.next_index = index + 1;
        }
    }

    fn check_callbacks(callbacks: &AppCallbacks, builtin: bool, options: &AppOptions) -> Result<()> {
        match callbacks {
            AppCallbacks::Builtin(_) if !builtin => Err(SessionError::InvalidArgument(
                "in-process callbacks require a builtin application".to_string(),
            )),
            AppCallbacks::External { .. } if builtin => Err(SessionError::InvalidArgument(
                "builtin application must supply in-process callbacks".to_string(),
            )),
            AppCallbacks::External { subscribed, .. } => {
                let mut required = CallbackMask::REQUIRED;
                if options.use_fifo_for_redirect() {
                    required |= CallbackMask::REDIRECT;
                }
                if subscribed.contains(required) {
                    Ok(())
                } else {
                    Err(SessionError::InvalidArgument(format!(
                        "incomplete callback set, missing {:?}",
                        required.difference(*subscribed)
                    )))
                }
            }
            AppCallbacks::Builtin(_) => Ok(()),
        }
    }

    /// Create the application's segment and event queue and register it
    pub fn attach(&mut self, args: AttachArgs) -> Result<(Arc<Application>, AttachReply)> {
        let builtin = args.builtin || args.options.is_builtin();
        Self::check_callbacks(&args.callbacks, builtin, &args.options)?;
        args.options.validate()?;

        let index = self.peek_index()?;
        let segment_size = or_default(args.options.segment_size, self.defaults.segment_size);
        let queue_size = or_default(args.options.evt_queue_size, self.defaults.event_queue_size);

        let segment = self.segments.create(segment_size)?;
        let event_queue = match self.queues.create(&segment, queue_size) {
            Ok(queue) => queue,
            Err(e) => {
                if let Err(cleanup) = self.segments.destroy(segment.name()) {
                    warn!("Failed to destroy segment {} after attach error: {}", segment.name(), cleanup);
                }
                return Err(match e {
                    SessionError::InvalidArgument(msg) => SessionError::InvalidArgument(msg),
                    other => SessionError::ResourceExhausted(other.to_string()),
                });
            }
        };

        let (notifier, api_client_index): (Arc<dyn SessionCallbacks>, _) = match args.callbacks {
            AppCallbacks::Builtin(callbacks) => (callbacks, None),
            AppCallbacks::External {
                api_client_index,
                subscribed,
            } => (
                Arc::new(EventQueueNotifier::new(event_queue.clone(), api_client_index, subscribed)),
                Some(api_client_index),
            ),
        };

        let app = Arc::new(Application {
            index,
            api_client_index,
            builtin,
            options: args.options,
            rx_fifo_size: or_default(args.options.rx_fifo_size, self.defaults.rx_fifo_size),
            tx_fifo_size: or_default(args.options.tx_fifo_size, self.defaults.tx_fifo_size),
            add_segment_size: or_default(args.options.add_segment_size, self.defaults.add_segment_size),
            notifier,
            segments: vec![segment.clone()],
            event_queue: event_queue.clone(),
        });

        let reply = AttachReply {
            app_index: index,
            segment_name: segment.name().to_string(),
            segment_size: segment.size(),
            event_queue_address: event_queue.address(),
        };

        self.take_index(index);
        self.apps.insert(index, app.clone());
        self.publish();

        info!(
            "Attached application {} (builtin: {}, segment {})",
            index, builtin, reply.segment_name
        );
        Ok((app, reply))
    }

    /// Tear down the event queue, then every segment, then free the index.
    ///
    /// The caller has already checked that nothing refers to the
    /// application any more.
    pub fn detach(&mut self, index: u32) -> Result<Arc<Application>> {
        let app = self
            .apps
            .get(&index)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(format!("application {}", index)))?;

        let queue = app.event_queue();
        self.queues.destroy(queue.segment_name(), queue.address())?;
        for segment in app.segments() {
            self.segments.destroy(segment.name())?;
        }

        self.apps.remove(&index);
        self.free_indices.insert(index);
        self.publish();

        info!("Detached application {}", index);
        Ok(app)
    }

    /// Add a segment to an application that allows it.
    ///
    /// Returns the updated record; the caller signals `segment_added`.
    pub fn add_segment(&mut self, index: u32, size: u64) -> Result<(Arc<Application>, SegmentInfo)> {
        let app = self
            .apps
            .get(&index)
            .ok_or_else(|| SessionError::NotFound(format!("application {}", index)))?;

        if !app.options.auto_add_segment() {
            return Err(SessionError::ResourceExhausted(format!(
                "application {} may not add segments",
                index
            )));
        }

        let size = or_default(size, app.add_segment_size);
        let segment = self.segments.create(size)?;
        let info = segment.info();

        let mut updated = Application::clone(app);
        updated.segments.push(segment);
        let updated = Arc::new(updated);

        self.apps.insert(index, updated.clone());
        self.publish();

        debug!("Application {} gained segment {}", index, info.name);
        Ok((updated, info))
    }

    /// Reserve rx/tx FIFO space for a new session of `index`.
    ///
    /// Newer segments are tried first. When none has room, a segment is
    /// added if the application allows it; its info is returned so the
    /// caller can signal it.
    pub fn alloc_fifos(&mut self, index: u32) -> Result<(FifoPlacement, Option<SegmentInfo>)> {
        let app = self
            .apps
            .get(&index)
            .ok_or_else(|| SessionError::NotFound(format!("application {}", index)))?;
        let (rx, tx) = (app.rx_fifo_size, app.tx_fifo_size);

        if let Some(placement) = app
            .segments
            .iter()
            .rev()
            .find_map(|segment| FifoPlacement::place(segment, rx, tx))
        {
            return Ok((placement, None));
        }

        if !app.options.auto_add_segment() {
            return Err(SessionError::ResourceExhausted(format!(
                "no fifo space left for application {}",
                index
            )));
        }

        // Room for both FIFOs plus the segment header and alignment slack
        let needed = rx as u64 + tx as u64 + 4096;
        let size = app.add_segment_size.max(needed);
        let (app, info) = self.add_segment(index, size)?;

        let newest = app.segments.last().ok_or_else(|| {
            SessionError::ResourceExhausted(format!("application {} has no segments", index))
        })?;
        let placement = FifoPlacement::place(newest, rx, tx).ok_or_else(|| {
            SessionError::ResourceExhausted(format!("no fifo space in new segment {}", info.name))
        })?;

        Ok((placement, Some(info)))
    }
}
