/// Color of a progress bar; tells the front end what a worker is doing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BarColor {
    /// Focusing chopped workspaces
    #[default]
    CYAN,
    /// Splitting the parent workspace
    MAGENTA,
    /// At least one unit of this worker failed
    RED,
    /// Writing GSAS files
    GREEN,
}

/// A progress message sent by a pipeline stage over an mpsc channel
#[derive(Debug, Clone, Default)]
pub struct WorkerStatus {
    pub progress: f32,
    pub run_number: i32,
    pub worker_id: usize,
    /// Chunk of the run this worker is handling
    pub batch: usize,
    pub color: BarColor,
}

impl WorkerStatus {
    pub fn new(
        progress: f32,
        run_number: i32,
        worker_id: usize,
        batch: usize,
        color: BarColor,
    ) -> Self {
        Self {
            progress,
            run_number,
            worker_id,
            batch,
            color,
        }
    }
}
