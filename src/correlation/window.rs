use crate::domain::silver::SilverEvent;
use crate::error::PipelineError;
use chrono::Duration;

/// Split an arrival-ordered stream into tumbling event-time groups.
///
/// The first event opens a group and fixes its start time; any event whose
/// `event_time` exceeds the start plus the window closes the group and
/// opens a new one starting at that event.
pub fn group_by_event_time(events: Vec<SilverEvent>, window: Duration) -> Vec<Vec<SilverEvent>> {
    let mut groups: Vec<Vec<SilverEvent>> = Vec::new();
    let mut current: Vec<SilverEvent> = Vec::new();
    let mut group_start = None;

    for event in events {
        match group_start {
            None => {
                group_start = Some(event.event_time);
                current.push(event);
            }
            Some(start) => {
                if event.event_time - start > window {
                    groups.push(std::mem::take(&mut current));
                    group_start = Some(event.event_time);
                    current.push(event);
                } else {
                    current.push(event);
                }
            }
        }
    }
    if !current.is_empty() {
        groups.push(current);
    }
    groups
}

/// Reject batches larger than the correlation cap.
pub fn check_batch_size(len: usize, max: usize) -> Result<(), PipelineError> {
    if len > max {
        return Err(PipelineError::BatchTooLarge { size: len, limit: max });
    }
    Ok(())
}
