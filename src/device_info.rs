use crate::{Driver, UnitInfo};
use log::info;

/// Reads every unit information string the driver offers and logs them as
/// one block. Entries the device cannot report are skipped.
pub fn log_unit_info<D: Driver>(driver: &mut D) -> Vec<(UnitInfo, String)> {
    let mut entries = Vec::with_capacity(UnitInfo::ALL.len());
    let mut info_log = String::new();

    for &item in UnitInfo::ALL.iter() {
        if let Ok(value) = driver.unit_info(item) {
            info_log.push_str(&format!("{:<20} {}\n", item.description(), value));
            entries.push((item, value));
        }
    }

    if info_log.ends_with('\n') {
        info_log.pop();
    }
    info!("Device information:\n{}", info_log);
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PicoStatus, SimConfig, SimulatedScope};

    #[test]
    fn reads_all_entries() {
        let mut sim = SimulatedScope::new(SimConfig::default());
        let entries = log_unit_info(&mut sim);
        assert_eq!(entries.len(), UnitInfo::ALL.len());
        assert!(entries.contains(&(UnitInfo::VariantInfo, "5444D".to_string())));
    }

    #[test]
    fn unavailable_entries_are_skipped() {
        let mut sim = SimulatedScope::new(SimConfig::default());
        sim.fail_next("unit_info", PicoStatus::InfoUnavailable);
        let entries = log_unit_info(&mut sim);
        assert_eq!(entries.len(), UnitInfo::ALL.len() - 1);
        assert_ne!(entries[0].0, UnitInfo::DriverVersion);
    }
}
