#![deny(missing_docs)]
#![warn(clippy::all)]

//! Demo pipelines for the dataflow runtime. Each pipeline submits a chain of command
//! groups and lets the runtime derive the ordering from the buffer accesses.

use dataflow::{
    Buffer, DiscardWrite, Error, Event, Queue, Range, Read, ReadWrite, Runtime,
};
use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

/// Work-items per group in [`reduce`].
pub const GROUP_SIZE: usize = 64;

/// Outcome of one pipeline run.
#[derive(Debug, Clone)]
pub struct Report {
    /// pipeline name
    pub name: &'static str,
    /// command groups submitted
    pub submissions: usize,
    /// wall time from first submission to the result being on the host
    pub elapsed: Duration,
    /// sum over the result, for comparing runs
    pub checksum: f64,
}

impl Report {
    fn new(name: &'static str, submissions: usize, start: Instant, checksum: f64) -> Self {
        let report = Report {
            name,
            submissions,
            elapsed: start.elapsed(),
            checksum,
        };
        log::info!(
            "{}: {} submissions in {:?}, checksum {}",
            report.name,
            report.submissions,
            report.elapsed,
            report.checksum
        );
        report
    }
}

/// `y = a * x + y` with `x = 0, 1, 2, ...` and `y = 1`.
pub fn saxpy(runtime: &Runtime, queue: &Queue, n: usize, a: f32) -> Result<Vec<f32>, Error> {
    let x = (0..n).map(|i| i as f32).collect::<Vec<_>>();
    let x = Buffer::<f32, 1>::from_slice(runtime, Range::new([n]), &x)?;
    let y = Buffer::<f32, 1>::from_slice(runtime, Range::new([n]), &vec![1.0; n])?;
    queue.submit(|cgh| {
        let x = x.get_access::<Read>(cgh)?;
        let y = y.get_access::<ReadWrite>(cgh)?;
        cgh.parallel_for(Range::new([n]), move |item| {
            let i = item.id();
            y.set(i, a * x.get(i) + y.get(i))
        })
    })?;
    let host = queue.host_access::<f32, 1, Read>(&y)?;
    Ok(host.as_slice().to_vec())
}

/// Initial state of [`jacobi`]: both ends held at 1, zero inside.
pub fn jacobi_initial(n: usize) -> Vec<f32> {
    let mut v = vec![0.0; n];
    if let Some(first) = v.first_mut() {
        *first = 1.0;
    }
    if let Some(last) = v.last_mut() {
        *last = 1.0;
    }
    v
}

/// One relaxation step on the host, the reference for [`jacobi`].
pub fn jacobi_step(src: &[f32]) -> Vec<f32> {
    let n = src.len();
    (0..n)
        .map(|i| {
            if i == 0 || i + 1 == n {
                src[i]
            } else {
                (src[i - 1] + src[i + 1]) * 0.5
            }
        })
        .collect()
}

/// 1D Jacobi relaxation, ping-ponging two buffers. Iteration `k` runs on
/// `queues[k % queues.len()]`, so consecutive steps hand the data across queues and
/// devices.
pub fn jacobi(
    runtime: &Runtime,
    queues: &[Queue],
    n: usize,
    iterations: usize,
) -> Result<Vec<f32>, Error> {
    if queues.is_empty() {
        return Err(Error::InvalidParameter("jacobi needs a queue".to_string()));
    }
    let range = Range::new([n]);
    let mut src = Buffer::<f32, 1>::from_slice(runtime, range, &jacobi_initial(n))?;
    let mut dst = Buffer::<f32, 1>::new(runtime, range)?;
    let mut events = vec![];
    for k in 0..iterations {
        let queue = &queues[k % queues.len()];
        let event = queue.submit(|cgh| {
            let from = src.get_access::<Read>(cgh)?;
            let to = dst.get_access::<DiscardWrite>(cgh)?;
            cgh.parallel_for(range, move |item| {
                let i = item.get(0);
                let value = if i == 0 || i + 1 == n {
                    from.get(i)
                } else {
                    (from.get(i - 1) + from.get(i + 1)) * 0.5
                };
                to.set(i, value)
            })
        })?;
        log::debug!(
            "jacobi step {} on device {} after {:?}",
            k,
            queue.device_id(),
            event.predecessors()
        );
        events.push(event);
        std::mem::swap(&mut src, &mut dst);
    }
    let result = Arc::new(Mutex::new(vec![0.0; n]));
    let last = &queues[iterations % queues.len()];
    last.submit(|cgh| {
        let from = src.get_access::<Read>(cgh)?;
        cgh.copy_to_host(&from, Arc::clone(&result))
    })?
    .wait()?;
    Event::wait_list(&events)?;
    let result = result.lock().unwrap().clone();
    Ok(result)
}

/// Sum of `data`: every work-group folds its slice in local memory, a single task adds
/// the partial sums.
pub fn reduce(runtime: &Runtime, queue: &Queue, data: &[u64]) -> Result<u64, Error> {
    let n = data.len();
    let groups = ((n + GROUP_SIZE - 1) / GROUP_SIZE).max(1);
    let input = Buffer::<u64, 1>::from_slice(runtime, Range::new([n.max(1)]), &{
        let mut padded = data.to_vec();
        padded.resize(n.max(1), 0);
        padded
    })?;
    let partial = Buffer::<u64, 1>::new(runtime, Range::new([groups]))?;
    let total = Buffer::<u64, 1>::new(runtime, Range::new([1]))?;
    queue.submit(|cgh| {
        let input = input.get_access::<Read>(cgh)?;
        let partial = partial.get_access::<DiscardWrite>(cgh)?;
        let scratch = cgh.local_memory::<u64>(GROUP_SIZE);
        cgh.parallel_for_work_group(
            Range::new([groups]),
            Range::new([GROUP_SIZE]),
            move |group| {
                group.parallel_for_work_item(|item| {
                    let i = item.global_id()[0];
                    let value = if i < n { input.get(i) } else { 0 };
                    scratch.set(group, item.local_id()[0], value)
                });
                let sum = (0..GROUP_SIZE).map(|i| scratch.get(group, i)).sum::<u64>();
                partial.set(group.id(), sum);
            },
        )
    })?;
    queue.submit(|cgh| {
        let partial = partial.get_access::<Read>(cgh)?;
        let total = total.get_access::<DiscardWrite>(cgh)?;
        cgh.single_task(move || {
            let sum = (0..groups).map(|g| partial.get(g)).sum::<u64>();
            total.set(0, sum)
        })
    })?;
    let host = queue.host_access::<u64, 1, Read>(&total)?;
    Ok(host.get(0))
}

/// Options of [`run_all`].
#[derive(Debug, Clone, Copy)]
pub struct Options {
    /// elements per buffer
    pub elements: usize,
    /// Jacobi iterations
    pub iterations: usize,
    /// queues, spread round robin over the devices
    pub queues: usize,
}

/// Run every pipeline once on `runtime`.
pub fn run_all(runtime: &Runtime, options: Options) -> Result<Vec<Report>, Error> {
    if options.elements == 0 || options.queues == 0 {
        return Err(Error::InvalidParameter(
            "elements and queues must be positive".to_string(),
        ));
    }
    let queues = (0..options.queues)
        .map(|i| runtime.queue(i % runtime.device_count()))
        .collect::<Result<Vec<_>, _>>()?;
    let mut reports = vec![];

    let start = Instant::now();
    let y = saxpy(runtime, &queues[0], options.elements, 2.0)?;
    reports.push(Report::new(
        "saxpy",
        1,
        start,
        y.iter().map(|&v| v as f64).sum(),
    ));

    let start = Instant::now();
    let v = jacobi(runtime, &queues, options.elements, options.iterations)?;
    reports.push(Report::new(
        "jacobi",
        options.iterations + 1,
        start,
        v.iter().map(|&v| v as f64).sum(),
    ));

    let start = Instant::now();
    let data = (0..options.elements as u64).collect::<Vec<_>>();
    let sum = reduce(runtime, &queues[queues.len() - 1], &data)?;
    reports.push(Report::new("reduce", 2, start, sum as f64));

    for queue in &queues {
        queue.wait_and_throw();
    }
    Ok(reports)
}

#[cfg(test)]
mod test {
    use super::*;
    use serial_test::serial;

    #[serial]
    #[test]
    fn test_saxpy() {
        let runtime = Runtime::new().unwrap();
        let queue = runtime.queue(0).unwrap();
        let y = saxpy(&runtime, &queue, 300, 3.0).unwrap();
        assert_eq!(y.len(), 300);
        assert_eq!(y[0], 1.0);
        assert_eq!(y[299], 3.0 * 299.0 + 1.0);
    }

    #[serial]
    #[test]
    fn test_jacobi_across_devices() {
        let runtime = Runtime::builder().device_count(2).build().unwrap();
        let queues = vec![runtime.queue(0).unwrap(), runtime.queue(1).unwrap()];
        let n = 33;
        let iterations = 7;
        let result = jacobi(&runtime, &queues, n, iterations).unwrap();
        let mut expected = jacobi_initial(n);
        for _ in 0..iterations {
            expected = jacobi_step(&expected);
        }
        assert_eq!(result, expected);
        assert!(matches!(
            jacobi(&runtime, &[], n, 1),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[serial]
    #[test]
    fn test_reduce() {
        let runtime = Runtime::new().unwrap();
        let queue = runtime.queue(0).unwrap();
        let data = (1..=1000).collect::<Vec<u64>>();
        assert_eq!(reduce(&runtime, &queue, &data).unwrap(), 500500);
        assert_eq!(reduce(&runtime, &queue, &[]).unwrap(), 0);
    }

    #[serial]
    #[test]
    fn test_run_all() {
        let runtime = Runtime::builder().device_count(2).build().unwrap();
        let options = Options {
            elements: 128,
            iterations: 4,
            queues: 3,
        };
        let reports = run_all(&runtime, options).unwrap();
        let names = reports.iter().map(|r| r.name).collect::<Vec<_>>();
        assert_eq!(names, vec!["saxpy", "jacobi", "reduce"]);
        assert_eq!(reports[2].checksum, (127 * 128 / 2) as f64);
    }
}
