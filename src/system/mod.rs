//! System orchestration: shared state, the graph manager, and thread setup.

pub mod graph_manager;
pub mod messages;
pub mod shared_state;

pub use graph_manager::{GraphManager, OptimizationSummary};
pub use messages::NewVertexMsg;
pub use shared_state::{ManagerState, SharedState};

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::Result;
use crossbeam_channel::bounded;

use crate::io::SystemConfig;
use crate::loop_closing::{LoopCloser, LoopCloserConfig, LoopDetector};
use crate::optimizer::LevenbergMarquardt;

/// Top-level back-end orchestrating the intake worker and the loop closer.
///
/// Owns the graph manager handle and the two worker threads. Producers get
/// the manager via [`SlamBackend::manager`] and feed frames from their own
/// threads.
pub struct SlamBackend {
    manager: GraphManager,

    /// Handle to the intake worker thread.
    worker_handle: Option<JoinHandle<()>>,

    /// Handle to the loop-closing thread.
    loop_handle: Option<JoinHandle<()>>,
}

impl SlamBackend {
    /// Create the back-end and spawn its threads.
    pub fn new(config: SystemConfig, detector: Box<dyn LoopDetector>) -> Result<Self> {
        let (vertex_tx, vertex_rx) = bounded::<NewVertexMsg>(config.graph.channel_capacity);

        let manager = GraphManager::new(
            &config,
            Arc::new(LevenbergMarquardt::default()),
            vertex_tx,
        )?;
        manager.init();

        let worker = manager.clone();
        let worker_handle = thread::spawn(move || worker.run());

        let closer_config = LoopCloserConfig {
            window: config.graph.loop_window,
            best_n: config.graph.loop_candidates,
        };
        let closer_manager = manager.clone();
        let loop_handle = thread::spawn(move || {
            let mut closer = LoopCloser::new(closer_manager, detector, closer_config);
            closer.run(vertex_rx);
        });

        Ok(Self {
            manager,
            worker_handle: Some(worker_handle),
            loop_handle: Some(loop_handle),
        })
    }

    /// The graph manager handle.
    pub fn manager(&self) -> &GraphManager {
        &self.manager
    }

    /// Shut down gracefully.
    ///
    /// Requests cooperative shutdown and joins both workers. Frames still
    /// queued are discarded; an in-flight optimization pass completes
    /// before the worker exits.
    pub fn shutdown(&mut self) {
        self.manager.request_shutdown();
        if let Some(handle) = self.worker_handle.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.loop_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SlamBackend {
    fn drop(&mut self) {
        self.shutdown();
    }
}
