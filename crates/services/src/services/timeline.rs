use std::collections::HashMap;

use serde::Serialize;
use sqlx::PgPool;
use ts_rs::TS;
use uuid::Uuid;

use db::models::{
    dependency_edge::{DependencyEdge, DependencyType},
    project::Project,
    task::{Task, TaskPriority},
};

const MS_PER_DAY: f64 = 86_400_000.0;
const DEFAULT_ESTIMATE_HOURS: f64 = 4.0;

/// Scheduling input for one task, decoupled from the database row so the
/// forward pass stays a pure function.
#[derive(Debug, Clone)]
pub struct ScheduleInput {
    pub id: Uuid,
    pub priority: TaskPriority,
    pub estimated_hours: Option<f64>,
    /// Completed tasks pin to their actual timestamps instead of projections.
    pub actual: Option<(i64, i64)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledTask {
    pub start: i64,
    pub end: i64,
    pub duration_days: f64,
    pub actual: bool,
}

#[derive(Debug, Clone, Serialize, TS)]
pub struct TimelineTask {
    pub id: Uuid,
    pub title: String,
    pub status: String,
    pub priority: TaskPriority,
    pub assigned_agent: Option<String>,
    pub tags: Vec<String>,
    pub estimated_hours: Option<f64>,
    pub dependencies: Vec<Uuid>,
    pub scheduled_start: i64,
    pub scheduled_end: i64,
    pub duration_days: f64,
    pub actual: bool,
    pub is_critical: bool,
}

#[derive(Debug, Clone, Serialize, TS)]
pub struct TimelineResult {
    pub tasks: Vec<TimelineTask>,
    pub project_start: i64,
    pub project_end: i64,
    pub total_hours: f64,
    pub total_days: f64,
    pub critical_path: Vec<Uuid>,
    pub hours_per_day: f64,
}

/// Dependency-aware forward scheduling.
///
/// Tasks are visited in topological order; each starts at the latest end of
/// its blocking predecessors (or project start), with duration
/// `estimated_hours / hours_per_day` in days. Completed tasks keep their
/// actual start/end.
pub fn forward_schedule(
    tasks: &[ScheduleInput],
    edges: &[(Uuid, Uuid)],
    project_start: i64,
    hours_per_day: f64,
) -> HashMap<Uuid, ScheduledTask> {
    let mut deps: HashMap<Uuid, Vec<Uuid>> = tasks.iter().map(|t| (t.id, Vec::new())).collect();
    let mut dependents: HashMap<Uuid, Vec<Uuid>> =
        tasks.iter().map(|t| (t.id, Vec::new())).collect();
    for (from, to) in edges {
        if let Some(d) = deps.get_mut(to) {
            d.push(*from);
        }
        if let Some(d) = dependents.get_mut(from) {
            d.push(*to);
        }
    }

    let task_map: HashMap<Uuid, &ScheduleInput> = tasks.iter().map(|t| (t.id, t)).collect();

    // Kahn's ordering with a priority-sorted frontier for stable output.
    let mut in_degree: HashMap<Uuid, usize> =
        tasks.iter().map(|t| (t.id, deps[&t.id].len())).collect();
    let mut queue: Vec<Uuid> = in_degree
        .iter()
        .filter(|&(_, &d)| d == 0)
        .map(|(&id, _)| id)
        .collect();
    let mut topo: Vec<Uuid> = Vec::with_capacity(tasks.len());
    while !queue.is_empty() {
        queue.sort_by_key(|id| (task_map[id].priority, *id));
        let id = queue.remove(0);
        topo.push(id);
        for &next in dependents.get(&id).map(Vec::as_slice).unwrap_or_default() {
            let deg = in_degree.get_mut(&next).expect("dependent in task set");
            *deg -= 1;
            if *deg == 0 {
                queue.push(next);
            }
        }
    }
    // Cycles cannot occur on a validated graph; schedule stragglers anyway.
    for t in tasks {
        if !topo.contains(&t.id) {
            topo.push(t.id);
        }
    }

    let mut scheduled: HashMap<Uuid, ScheduledTask> = HashMap::new();
    for id in topo {
        let task = task_map[&id];
        if let Some((start, end)) = task.actual {
            scheduled.insert(
                id,
                ScheduledTask {
                    start,
                    end,
                    duration_days: ((end - start) as f64 / MS_PER_DAY * 10.0).round() / 10.0,
                    actual: true,
                },
            );
            continue;
        }

        let hours = task.estimated_hours.unwrap_or(DEFAULT_ESTIMATE_HOURS);
        let duration_days = hours / hours_per_day;
        let duration_ms = (duration_days * MS_PER_DAY) as i64;

        let earliest_start = deps[&id]
            .iter()
            .filter_map(|dep| scheduled.get(dep).map(|s| s.end))
            .max()
            .unwrap_or(project_start);

        scheduled.insert(
            id,
            ScheduledTask {
                start: earliest_start,
                end: earliest_start + duration_ms,
                duration_days: (duration_days * 10.0).round() / 10.0,
                actual: false,
            },
        );
    }
    scheduled
}

/// Trace the critical path backwards from the latest-ending task, following
/// at each hop the blocking predecessor with the latest end.
pub fn trace_critical_path(
    scheduled: &HashMap<Uuid, ScheduledTask>,
    edges: &[(Uuid, Uuid)],
) -> Vec<Uuid> {
    let mut deps: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    for (from, to) in edges {
        deps.entry(*to).or_default().push(*from);
    }

    let Some((&latest, _)) = scheduled
        .iter()
        .max_by(|a, b| a.1.end.cmp(&b.1.end).then_with(|| a.0.cmp(b.0)))
    else {
        return Vec::new();
    };

    let mut path = vec![latest];
    let mut current = latest;
    while let Some(preds) = deps.get(&current) {
        let Some(&prev) = preds
            .iter()
            .max_by_key(|p| scheduled.get(p).map(|s| s.end).unwrap_or(0))
        else {
            break;
        };
        path.push(prev);
        current = prev;
    }
    path.reverse();
    path
}

/// Compute the Gantt timeline for all tasks in a project.
pub async fn project_timeline(
    pool: &PgPool,
    project: &Project,
    hours_per_day: f64,
) -> Result<TimelineResult, sqlx::Error> {
    let project_start = project.created_at.timestamp_millis();
    let tasks = Task::find_by_project(pool, project.id).await?;

    if tasks.is_empty() {
        return Ok(TimelineResult {
            tasks: Vec::new(),
            project_start,
            project_end: project_start,
            total_hours: 0.0,
            total_days: 0.0,
            critical_path: Vec::new(),
            hours_per_day,
        });
    }

    let edges: Vec<(Uuid, Uuid)> = DependencyEdge::find_by_project(pool, project.id)
        .await?
        .into_iter()
        .filter(|e| e.edge_type == DependencyType::Blocks)
        .map(|e| (e.from_task_id, e.to_task_id))
        .collect();

    let semantics = project.semantics();
    let inputs: Vec<ScheduleInput> = tasks
        .iter()
        .map(|t| ScheduleInput {
            id: t.id,
            priority: t.priority,
            estimated_hours: t.estimated_hours,
            actual: match (&t.completed_at, semantics.is_done(&t.status)) {
                (Some(done_at), true) => {
                    Some((t.created_at.timestamp_millis(), done_at.timestamp_millis()))
                }
                _ => None,
            },
        })
        .collect();

    let scheduled = forward_schedule(&inputs, &edges, project_start, hours_per_day);
    let critical = trace_critical_path(&scheduled, &edges);

    let mut deps_of: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    for (from, to) in &edges {
        deps_of.entry(*to).or_default().push(*from);
    }

    let project_end = scheduled
        .values()
        .map(|s| s.end)
        .max()
        .unwrap_or(project_start);
    let total_hours: f64 = tasks
        .iter()
        .map(|t| t.estimated_hours.unwrap_or(DEFAULT_ESTIMATE_HOURS))
        .sum();

    let timeline_tasks = tasks
        .iter()
        .map(|t| {
            let sched = scheduled.get(&t.id).cloned().unwrap_or(ScheduledTask {
                start: project_start,
                end: project_start,
                duration_days: 0.0,
                actual: false,
            });
            TimelineTask {
                id: t.id,
                title: t.title.clone(),
                status: t.status.clone(),
                priority: t.priority,
                assigned_agent: t.assigned_agent.clone(),
                tags: t.tags.0.clone(),
                estimated_hours: t.estimated_hours,
                dependencies: deps_of.get(&t.id).cloned().unwrap_or_default(),
                scheduled_start: sched.start,
                scheduled_end: sched.end,
                duration_days: sched.duration_days,
                actual: sched.actual,
                is_critical: critical.contains(&t.id),
            }
        })
        .collect();

    Ok(TimelineResult {
        tasks: timeline_tasks,
        project_start,
        project_end,
        total_hours,
        total_days: (total_hours / hours_per_day * 10.0).round() / 10.0,
        critical_path: critical,
        hours_per_day,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uid(n: u8) -> Uuid {
        Uuid::from_bytes([n; 16])
    }

    fn input(id: Uuid, hours: f64) -> ScheduleInput {
        ScheduleInput {
            id,
            priority: TaskPriority::P2,
            estimated_hours: Some(hours),
            actual: None,
        }
    }

    #[test]
    fn unblocked_tasks_start_at_project_start() {
        let a = uid(1);
        let sched = forward_schedule(&[input(a, 8.0)], &[], 1_000, 8.0);
        let s = &sched[&a];
        assert_eq!(s.start, 1_000);
        assert_eq!(s.end, 1_000 + MS_PER_DAY as i64);
        assert_eq!(s.duration_days, 1.0);
    }

    #[test]
    fn dependent_starts_after_latest_predecessor() {
        let (a, b, c) = (uid(1), uid(2), uid(3));
        // a (1 day) and b (2 days) both block c.
        let sched = forward_schedule(
            &[input(a, 8.0), input(b, 16.0), input(c, 8.0)],
            &[(a, c), (b, c)],
            0,
            8.0,
        );
        assert_eq!(sched[&c].start, sched[&b].end);
        assert!(sched[&c].start > sched[&a].end);
    }

    #[test]
    fn completed_tasks_pin_to_actual_dates() {
        let a = uid(1);
        let mut done = input(a, 40.0);
        done.actual = Some((100, 200));
        let sched = forward_schedule(&[done], &[], 0, 8.0);
        assert_eq!(sched[&a].start, 100);
        assert_eq!(sched[&a].end, 200);
        assert!(sched[&a].actual);
    }

    #[test]
    fn missing_estimate_defaults_to_four_hours() {
        let a = uid(1);
        let sched = forward_schedule(
            &[ScheduleInput {
                id: a,
                priority: TaskPriority::P2,
                estimated_hours: None,
                actual: None,
            }],
            &[],
            0,
            8.0,
        );
        assert_eq!(sched[&a].duration_days, 0.5);
    }

    #[test]
    fn critical_path_traces_latest_chain() {
        let (a, b, c) = (uid(1), uid(2), uid(3));
        // a→b→c linear; path is the whole chain.
        let sched = forward_schedule(
            &[input(a, 8.0), input(b, 8.0), input(c, 8.0)],
            &[(a, b), (b, c)],
            0,
            8.0,
        );
        assert_eq!(trace_critical_path(&sched, &[(a, b), (b, c)]), vec![a, b, c]);
    }

    #[test]
    fn critical_path_prefers_longer_branch() {
        let (a, b, c) = (uid(1), uid(2), uid(3));
        // a and b both block c; b takes longer.
        let edges = vec![(a, c), (b, c)];
        let sched = forward_schedule(
            &[input(a, 4.0), input(b, 40.0), input(c, 8.0)],
            &edges,
            0,
            8.0,
        );
        assert_eq!(trace_critical_path(&sched, &edges), vec![b, c]);
    }
}
