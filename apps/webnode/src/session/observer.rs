use tracing::info;
use webnode_proto::UserDataUpdate;

/// Receives the points updates pushed over the node socket.
pub trait PointsObserver: Send + Sync {
    fn on_points(&self, update: &UserDataUpdate);
}

impl<F> PointsObserver for F
where
    F: Fn(&UserDataUpdate) + Send + Sync,
{
    fn on_points(&self, update: &UserDataUpdate) {
        (self)(update)
    }
}

/// Writes every update to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogObserver;

impl PointsObserver for LogObserver {
    fn on_points(&self, update: &UserDataUpdate) {
        info!(
            target: "webnode::points",
            today = update.today_points,
            total = update.total_points,
            "points updated"
        );
    }
}
