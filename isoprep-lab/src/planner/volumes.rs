//! Volume rules shared by the chain builders
//!
//! A well's required volume covers everything that leaves it (every copy of
//! every transfer) plus the dead volume of its plate. A well fed from a
//! source at a higher concentration receives `required × c / c_source`; the
//! rest is buffer.

use isoprep_common::{units, PipettingSpecs, ReservoirSpecs};

/// Volume to take from a source so `volume` µl end up at `concentration`
pub fn source_volume(volume: f64, concentration: f64, source_concentration: f64) -> f64 {
    units::round_volume(units::donor_volume(volume, concentration, source_concentration))
}

/// Buffer completing a well fed with `donation` µl
pub fn buffer_volume(volume: f64, donation: f64) -> f64 {
    units::round_volume((volume - donation).max(0.0))
}

/// Dead volume of a well serving `target_count` transfers
pub fn dead_volume(reservoir: &ReservoirSpecs, specs: &PipettingSpecs, target_count: usize, increment: f64) -> f64 {
    reservoir.dead_volume(target_count, specs, increment)
}

/// Raise a required volume until the donation and the buffer are pipettable
///
/// The donation must reach `min_donation`. A buffer of exactly zero is
/// legal; a positive buffer must reach `min_buffer`.
pub fn fit_volume(
    required: f64,
    concentration: f64,
    source_concentration: f64,
    min_donation: f64,
    min_buffer: f64,
) -> f64 {
    let ratio = concentration / source_concentration;
    let mut volume = units::ceil_volume(required);

    if units::is_smaller_than(source_volume(volume, concentration, source_concentration), min_donation) {
        volume = units::ceil_volume(min_donation / ratio);
    }

    let buffer = buffer_volume(volume, source_volume(volume, concentration, source_concentration));
    if units::is_larger_than(buffer, 0.0) && units::is_smaller_than(buffer, min_buffer) {
        volume = units::ceil_volume(volume.max(min_buffer / (1.0 - ratio)));
        // rounding of the donation can eat up to half a step of buffer
        while units::is_smaller_than(
            buffer_volume(volume, source_volume(volume, concentration, source_concentration)),
            min_buffer,
        ) {
            volume = units::round_volume(volume + 0.1);
        }
    }
    volume
}

#[cfg(test)]
mod tests {
    use super::*;
    use isoprep_common::Pipettor;

    #[test]
    fn test_source_volume_rounds_to_grid() {
        assert_eq!(source_volume(7.0, 10000.0, 50000.0), 1.4);
        assert_eq!(source_volume(2.0, 50000.0, 50000.0), 2.0);
    }

    #[test]
    fn test_fit_keeps_pipettable_volume() {
        // 7 µl at 10000 nM from 50000 nM: 1.4 µl stock + 5.6 µl buffer
        assert_eq!(fit_volume(7.0, 10000.0, 50000.0, 1.0, 2.0), 7.0);
    }

    #[test]
    fn test_fit_raises_small_donation() {
        // 7 µl at 1000 nM would need 0.14 µl of stock
        let volume = fit_volume(7.0, 1000.0, 50000.0, 1.0, 2.0);
        assert_eq!(volume, 50.0);
        assert_eq!(source_volume(volume, 1000.0, 50000.0), 1.0);
    }

    #[test]
    fn test_fit_raises_small_buffer() {
        // 10 µl at 90 nM from 100 nM leaves a 1 µl buffer
        let volume = fit_volume(10.0, 90.0, 100.0, 2.0, 2.0);
        let buffer = buffer_volume(volume, source_volume(volume, 90.0, 100.0));
        assert!(!units::is_smaller_than(buffer, 2.0));
        assert_eq!(volume, 20.0);
    }

    #[test]
    fn test_zero_buffer_is_legal() {
        assert_eq!(fit_volume(2.0, 50000.0, 50000.0, 1.0, 2.0), 2.0);
    }

    #[test]
    fn test_dead_volume_follows_pipettor() {
        let plate = ReservoirSpecs::standard_96();
        let biomek = PipettingSpecs::default_for(Pipettor::Biomek);
        assert_eq!(dead_volume(&plate, &biomek, 3, 0.5), 6.0);
    }
}
