//! Pool de workers con puerto de salida FIFO.
//!
//! Interfaz de pipelining a nivel de fila que el runtime ofrece a los
//! transforms que paralelizan internamente (p.ej. llamadas a servicios
//! externos): `accept` aplica backpressure cuando el buffer en vuelo está
//! lleno y las salidas emergen en ORDEN DE ENVÍO, no de terminación. El
//! despacho de filas del orquestador sigue siendo single-threaded; esto vive
//! dentro del transform.

use std::collections::BTreeMap;
use std::sync::mpsc::{sync_channel, Receiver, RecvError, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;

use serde_json::Value;

use crate::contracts::PluginCallError;

type RowOutput = Result<Value, PluginCallError>;
type Job = (u64, Value);

pub struct RowPipeline {
    workers: Vec<JoinHandle<()>>,
    job_tx: Option<SyncSender<Job>>,
    result_rx: Receiver<(u64, RowOutput)>,
    next_seq: u64,
    next_emit: u64,
    in_flight: usize,
    max_pending: usize,
    reorder: BTreeMap<u64, RowOutput>,
}

impl RowPipeline {
    /// Crea el pool. `max_pending` acota el buffer en vuelo (y por lo tanto
    /// la memoria); `max_workers`, si viene, acota el fan-out por encima de
    /// lo que pida el transform.
    pub fn connect_output<F>(workers: usize,
                             max_pending: usize,
                             max_workers: Option<usize>,
                             work: F)
                             -> Self
        where F: Fn(Value) -> RowOutput + Send + Sync + 'static
    {
        let worker_count = match max_workers {
            Some(cap) => workers.min(cap).max(1),
            None => workers.max(1),
        };
        let pending = max_pending.max(worker_count);

        let (job_tx, job_rx) = sync_channel::<Job>(pending);
        let (result_tx, result_rx) = sync_channel::<(u64, RowOutput)>(pending);
        let job_rx = Arc::new(std::sync::Mutex::new(job_rx));
        let work = Arc::new(work);

        let mut handles = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let job_rx = Arc::clone(&job_rx);
            let result_tx = result_tx.clone();
            let work = Arc::clone(&work);
            handles.push(std::thread::spawn(move || loop {
                let job = {
                    let guard = job_rx.lock().expect("job channel poisoned");
                    guard.recv()
                };
                match job {
                    Ok((seq, row)) => {
                        let output = work(row);
                        if result_tx.send((seq, output)).is_err() {
                            break;
                        }
                    }
                    Err(RecvError) => break,
                }
            }));
        }

        Self { workers: handles,
               job_tx: Some(job_tx),
               result_rx,
               next_seq: 0,
               next_emit: 0,
               in_flight: 0,
               max_pending: pending,
               reorder: BTreeMap::new() }
    }

    /// Envía una fila al pool. Bloquea si el buffer en vuelo está lleno
    /// (backpressure) hasta drenar al menos una salida. Devuelve las salidas
    /// que quedaron listas EN ORDEN de envío.
    pub fn accept(&mut self, row: Value) -> Vec<RowOutput> {
        let mut ready = Vec::new();
        while self.in_flight >= self.max_pending {
            self.wait_one(&mut ready);
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.in_flight += 1;
        self.job_tx
            .as_ref()
            .expect("pipeline already closed")
            .send((seq, row))
            .expect("worker pool hung up");
        self.drain_ready(&mut ready);
        ready
    }

    /// Drena todas las salidas pendientes, en orden.
    pub fn flush(&mut self) -> Vec<RowOutput> {
        let mut ready = Vec::new();
        while self.in_flight > 0 {
            self.wait_one(&mut ready);
        }
        ready
    }

    /// Cierra el puerto de entrada y libera los workers. Las filas aún en
    /// vuelo se descartan; llamar a `flush` antes si importan.
    pub fn close(mut self) {
        self.job_tx.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }

    fn wait_one(&mut self, ready: &mut Vec<RowOutput>) {
        if let Ok((seq, output)) = self.result_rx.recv() {
            self.in_flight -= 1;
            self.reorder.insert(seq, output);
        }
        self.pop_in_order(ready);
    }

    fn drain_ready(&mut self, ready: &mut Vec<RowOutput>) {
        while let Ok((seq, output)) = self.result_rx.try_recv() {
            self.in_flight -= 1;
            self.reorder.insert(seq, output);
        }
        self.pop_in_order(ready);
    }

    fn pop_in_order(&mut self, ready: &mut Vec<RowOutput>) {
        while let Some(output) = self.reorder.remove(&self.next_emit) {
            ready.push(output);
            self.next_emit += 1;
        }
    }
}

impl Drop for RowPipeline {
    fn drop(&mut self) {
        self.job_tx.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}
