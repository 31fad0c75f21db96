//! Single-process scheduler: engine registry plus sticky assignments.

use std::time::Duration;

use chrono::Utc;
use conductor_types::engine::{EngineInfo, EngineLoad};
use dashmap::DashMap;

use super::{DistributedScheduler, SchedulerError, is_alive, select_engine};

#[derive(Debug)]
pub struct InMemoryScheduler {
    engines: DashMap<String, EngineInfo>,
    assignments: DashMap<i64, String>,
    stale_after: Duration,
}

impl InMemoryScheduler {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            engines: DashMap::new(),
            assignments: DashMap::new(),
            stale_after,
        }
    }

    fn snapshot(&self) -> Vec<EngineInfo> {
        let mut engines: Vec<EngineInfo> = self.engines.iter().map(|e| e.value().clone()).collect();
        engines.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        engines
    }
}

impl Default for InMemoryScheduler {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl DistributedScheduler for InMemoryScheduler {
    async fn register_engine(&self, info: &EngineInfo) -> Result<(), SchedulerError> {
        self.engines.insert(info.instance_id.clone(), info.clone());
        Ok(())
    }

    async fn unregister_engine(&self, engine_id: &str) -> Result<(), SchedulerError> {
        self.engines.remove(engine_id);
        self.assignments.retain(|_, assigned| assigned != engine_id);
        Ok(())
    }

    async fn update_heartbeat(&self, engine_id: &str, load: &EngineLoad) -> Result<(), SchedulerError> {
        let mut engine = self
            .engines
            .get_mut(engine_id)
            .ok_or_else(|| SchedulerError::UnknownEngine(engine_id.to_string()))?;
        engine.load = *load;
        engine.last_heartbeat = Utc::now();
        Ok(())
    }

    async fn assign_workflow(&self, instance_id: i64) -> Result<Option<String>, SchedulerError> {
        let now = Utc::now();
        if let Some(current) = self.assignments.get(&instance_id).map(|a| a.clone()) {
            let alive = self
                .engines
                .get(&current)
                .is_some_and(|e| is_alive(&e, now, self.stale_after));
            if alive {
                return Ok(Some(current));
            }
        }

        let engines = self.snapshot();
        let chosen = select_engine(&engines, &[], now, self.stale_after).map(|e| e.instance_id.clone());
        match &chosen {
            Some(id) => {
                self.assignments.insert(instance_id, id.clone());
            }
            None => {
                self.assignments.remove(&instance_id);
            }
        }
        Ok(chosen)
    }

    async fn assign_node(
        &self,
        _instance_id: i64,
        _node_id: &str,
        capabilities: &[String],
    ) -> Result<Option<String>, SchedulerError> {
        let engines = self.snapshot();
        Ok(select_engine(&engines, capabilities, Utc::now(), self.stale_after)
            .map(|e| e.instance_id.clone()))
    }

    async fn list_engines(&self) -> Result<Vec<EngineInfo>, SchedulerError> {
        Ok(self.snapshot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: &str, workflows: u32) -> EngineInfo {
        EngineInfo {
            instance_id: id.to_string(),
            hostname: "localhost".to_string(),
            load: EngineLoad {
                active_workflows: workflows,
                ..Default::default()
            },
            supported_executors: vec!["echo".to_string()],
            last_heartbeat: Utc::now(),
            started_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn assignment_is_sticky_while_engine_lives() {
        let scheduler = InMemoryScheduler::default();
        scheduler.register_engine(&info("a", 0)).await.unwrap();
        assert_eq!(scheduler.assign_workflow(1).await.unwrap().as_deref(), Some("a"));

        scheduler.register_engine(&info("b", 0)).await.unwrap();
        scheduler
            .update_heartbeat("a", &EngineLoad { active_workflows: 10, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(scheduler.assign_workflow(1).await.unwrap().as_deref(), Some("a"));
        assert_eq!(scheduler.assign_workflow(2).await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn unregister_moves_assignments() {
        let scheduler = InMemoryScheduler::default();
        scheduler.register_engine(&info("a", 0)).await.unwrap();
        scheduler.register_engine(&info("b", 3)).await.unwrap();
        assert_eq!(scheduler.assign_workflow(1).await.unwrap().as_deref(), Some("a"));

        scheduler.unregister_engine("a").await.unwrap();
        assert_eq!(scheduler.assign_workflow(1).await.unwrap().as_deref(), Some("b"));
        assert_eq!(scheduler.list_engines().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn heartbeat_for_unknown_engine_fails() {
        let scheduler = InMemoryScheduler::default();
        let err = scheduler
            .update_heartbeat("ghost", &EngineLoad::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::UnknownEngine(_)));
    }

    #[tokio::test]
    async fn no_engines_means_no_assignment() {
        let scheduler = InMemoryScheduler::default();
        assert!(scheduler.assign_workflow(1).await.unwrap().is_none());
        assert!(scheduler.assign_node(1, "n", &[]).await.unwrap().is_none());
    }
}
