// Communication channels lock-free - Device threads to the engine tick

use crate::midi::device::DeviceChange;
use crate::midi::event::MidiMessage;
use ringbuf::{HeapRb, traits::Split};

pub fn create_channel<T>(capacity: usize) -> (ringbuf::HeapProd<T>, ringbuf::HeapCons<T>) {
    let rb = HeapRb::<T>::new(capacity.max(1));
    rb.split()
}

pub type MidiProducer = ringbuf::HeapProd<MidiMessage>;
pub type MidiConsumer = ringbuf::HeapCons<MidiMessage>;

pub fn create_midi_channel(capacity: usize) -> (MidiProducer, MidiConsumer) {
    create_channel(capacity)
}

pub type DeviceChangeProducer = ringbuf::HeapProd<DeviceChange>;
pub type DeviceChangeConsumer = ringbuf::HeapCons<DeviceChange>;

pub fn create_device_channel(capacity: usize) -> (DeviceChangeProducer, DeviceChangeConsumer) {
    create_channel(capacity)
}
