use crate::booking::BookingConfirmation;
use crate::calendar::{AvailabilitySlot, BusinessHours};
use crate::dialog::Cue;
use crate::session::{CallSession, DialogState, Slots};
use crate::types::{InfoTopic, Language, Service};

use time::{Date, Month, Time, Weekday};

/// What the receptionist knows about the shop itself.
#[derive(Debug, Clone)]
pub struct ShopInfo {
    pub name: String,
    pub address: String,
    pub hours: BusinessHours,
}

fn weekday_name(day: Weekday, lang: Language) -> &'static str {
    match (lang, day) {
        (Language::English, Weekday::Monday) => "Monday",
        (Language::English, Weekday::Tuesday) => "Tuesday",
        (Language::English, Weekday::Wednesday) => "Wednesday",
        (Language::English, Weekday::Thursday) => "Thursday",
        (Language::English, Weekday::Friday) => "Friday",
        (Language::English, Weekday::Saturday) => "Saturday",
        (Language::English, Weekday::Sunday) => "Sunday",
        (Language::Arabic, Weekday::Monday) => "الاثنين",
        (Language::Arabic, Weekday::Tuesday) => "الثلاثاء",
        (Language::Arabic, Weekday::Wednesday) => "الأربعاء",
        (Language::Arabic, Weekday::Thursday) => "الخميس",
        (Language::Arabic, Weekday::Friday) => "الجمعة",
        (Language::Arabic, Weekday::Saturday) => "السبت",
        (Language::Arabic, Weekday::Sunday) => "الأحد",
    }
}

fn month_name(month: Month, lang: Language) -> &'static str {
    match lang {
        Language::English => match month {
            Month::January => "January",
            Month::February => "February",
            Month::March => "March",
            Month::April => "April",
            Month::May => "May",
            Month::June => "June",
            Month::July => "July",
            Month::August => "August",
            Month::September => "September",
            Month::October => "October",
            Month::November => "November",
            Month::December => "December",
        },
        Language::Arabic => match month {
            Month::January => "كانون الثاني",
            Month::February => "شباط",
            Month::March => "آذار",
            Month::April => "نيسان",
            Month::May => "أيار",
            Month::June => "حزيران",
            Month::July => "تموز",
            Month::August => "آب",
            Month::September => "أيلول",
            Month::October => "تشرين الأول",
            Month::November => "تشرين الثاني",
            Month::December => "كانون الأول",
        },
    }
}

pub fn say_date(date: Date, lang: Language) -> String {
    let weekday = weekday_name(date.weekday(), lang);
    let month = month_name(date.month(), lang);
    match lang {
        Language::English => format!("{weekday}, {month} {}", date.day()),
        Language::Arabic => format!("{weekday} {} {month}", date.day()),
    }
}

pub fn say_time(time: Time, lang: Language) -> String {
    let (hour, minute) = (time.hour(), time.minute());
    let twelve = match hour % 12 {
        0 => 12,
        h => h,
    };
    let clock = if minute == 0 {
        twelve.to_string()
    } else {
        format!("{twelve}:{minute:02}")
    };
    match lang {
        Language::English => {
            let meridiem = if hour < 12 { "AM" } else { "PM" };
            format!("{clock} {meridiem}")
        }
        Language::Arabic => {
            let period = match hour {
                0..=11 => "الصبح",
                12..=17 => "بعد الظهر",
                _ => "المسا",
            };
            format!("الساعة {clock} {period}")
        }
    }
}

/// Spells a booking reference one character at a time so speech synthesis reads it clearly.
pub fn say_reference(booking_ref: &str) -> String {
    booking_ref
        .chars()
        .map(String::from)
        .collect::<Vec<_>>()
        .join(" ")
}

fn join_choices(items: &[String], lang: Language) -> String {
    let or = match lang {
        Language::English => "or",
        Language::Arabic => "أو",
    };
    match items {
        [] => String::new(),
        [one] => one.clone(),
        [a, b] => format!("{a} {or} {b}"),
        [rest @ .., last] => format!("{}, {or} {last}", rest.join(", ")),
    }
}

fn say_alternatives(alternatives: &[AvailabilitySlot], lang: Language) -> String {
    let same_day = alternatives.windows(2).all(|w| w[0].date == w[1].date);
    let times: Vec<String> = alternatives
        .iter()
        .map(|a| say_time(a.time, lang))
        .collect();
    match (alternatives.first(), same_day) {
        (Some(first), true) => {
            let on = match lang {
                Language::English => "on",
                Language::Arabic => "يوم",
            };
            format!("{} {on} {}", join_choices(&times, lang), say_date(first.date, lang))
        }
        _ => {
            let items: Vec<String> = alternatives
                .iter()
                .map(|a| format!("{} {}", say_date(a.date, lang), say_time(a.time, lang)))
                .collect();
            join_choices(&items, lang)
        }
    }
}

fn services_line(lang: Language) -> String {
    match lang {
        Language::English => {
            let items: Vec<String> = Service::ALL
                .iter()
                .map(|s| match s {
                    Service::FullService => format!("the {}", s.name(lang)),
                    _ => format!("a {}", s.name(lang)),
                })
                .collect();
            match items.split_last() {
                Some((last, rest)) if !rest.is_empty() => {
                    format!("We offer {}, and {last}.", rest.join(", "))
                }
                _ => format!("We offer {}.", items.join("")),
            }
        }
        Language::Arabic => {
            let names: Vec<&str> = Service::ALL.iter().map(|s| s.name(lang)).collect();
            format!("عنا {}.", names.join("، "))
        }
    }
}

fn prices_line(lang: Language) -> String {
    let items: Vec<String> = Service::ALL
        .iter()
        .map(|s| match lang {
            Language::English => format!("{} ${}", s.name(lang), s.price_usd()),
            Language::Arabic => format!("{} {} دولار", s.name(lang), s.price_usd()),
        })
        .collect();
    match lang {
        Language::English => format!("Our prices: {}.", items.join(", ")),
        Language::Arabic => format!("الأسعار: {}.", items.join("، ")),
    }
}

fn hours_line(shop: &ShopInfo, lang: Language) -> String {
    let hours = &shop.hours;
    let closed: Vec<String> = hours
        .closed_days
        .iter()
        .map(|d| weekday_name(*d, lang).to_string())
        .collect();
    let opens = say_time(hours.opens, lang);
    let closes = say_time(hours.closes, lang);
    match (lang, closed.is_empty()) {
        (Language::English, true) => format!("We're open every day from {opens} to {closes}."),
        (Language::English, false) => format!(
            "We're open from {opens} to {closes}, every day except {}.",
            closed.join(" and ")
        ),
        (Language::Arabic, true) => format!("نحنا فاتحين كل يوم من {opens} لـ {closes}."),
        (Language::Arabic, false) => format!(
            "نحنا فاتحين من {opens} لـ {closes}، كل يوم ما عدا {}.",
            closed.join(" و")
        ),
    }
}

fn info_answer(shop: &ShopInfo, topic: Option<InfoTopic>, lang: Language) -> String {
    match topic {
        Some(InfoTopic::Hours) => hours_line(shop, lang),
        Some(InfoTopic::Services) => services_line(lang),
        Some(InfoTopic::Prices) => prices_line(lang),
        Some(InfoTopic::Location) => match lang {
            Language::English => format!("You'll find us at {}.", shop.address),
            Language::Arabic => format!("عنواننا {}.", shop.address),
        },
        None => format!("{} {}", services_line(lang), hours_line(shop, lang)),
    }
}

/// Answer to "what do you have free on Friday", from the alternatives just looked up.
fn free_line(day: Date, offered: &[AvailabilitySlot], lang: Language) -> String {
    let asked = say_date(day, lang);
    if offered.is_empty() {
        return match lang {
            Language::English => format!("Sorry, I have nothing free on {asked} or the days after."),
            Language::Arabic => format!("عفواً، ما في شي فاضي يوم {asked} ولا بالأيام يلي بعده."),
        };
    }
    if offered.iter().all(|a| a.date == day) {
        let times: Vec<String> = offered.iter().map(|a| say_time(a.time, lang)).collect();
        let times = join_choices(&times, lang);
        return match lang {
            Language::English => format!("On {asked} I have {times} free."),
            Language::Arabic => format!("يوم {asked} عندي {times} فاضيين."),
        };
    }
    let offer = say_alternatives(offered, lang);
    match lang {
        Language::English => format!("{asked} is fully booked. The next free times are {offer}."),
        Language::Arabic => format!("يوم {asked} محجوز كلو. أقرب مواعيد فاضية {offer}."),
    }
}

fn confirm_question(slots: &Slots, lang: Language) -> String {
    let Some(details) = slots.booking_details() else {
        return match lang {
            Language::English => "Shall I book that for you?".to_string(),
            Language::Arabic => "بتحب احجزلك؟".to_string(),
        };
    };
    let service = details.service.name(lang);
    let date = say_date(details.date, lang);
    let time = say_time(details.time, lang);
    let name = details.customer_name;
    match lang {
        Language::English => {
            format!("So that's a {service} on {date} at {time}, for {name}. Shall I book it?")
        }
        Language::Arabic => format!("يعني {service} يوم {date} {time}، باسم {name}. بثبتلك الموعد؟"),
    }
}

fn question(session: &CallSession, lang: Language) -> String {
    let slots = &session.slots;
    match (session.state(), lang) {
        (DialogState::Greeting, Language::English) => "How can I help you today?".to_string(),
        (DialogState::Greeting, Language::Arabic) => "كيف فيني ساعدك اليوم؟".to_string(),
        (DialogState::CollectService, Language::English) => {
            "Which service would you like: a haircut, a beard trim, a hair wash, or the full service?"
                .to_string()
        }
        (DialogState::CollectService, Language::Arabic) => {
            "شو الخدمة يلي بدك ياها: قص شعر، تشذيب دقن، غسيل شعر، أو الخدمة الكاملة؟".to_string()
        }
        (DialogState::CollectDatetime, _) if !session.alternatives.is_empty() => {
            let offer = say_alternatives(&session.alternatives, lang);
            match lang {
                Language::English => format!("I can offer {offer}. Which works for you?"),
                Language::Arabic => format!("فيني اعطيك {offer}. شو بيناسبك؟"),
            }
        }
        (DialogState::CollectDatetime, _) => match (&slots.date, &slots.time, lang) {
            (Some(date), None, Language::English) => {
                format!("What time on {} would suit you?", say_date(date.value, lang))
            }
            (Some(date), None, Language::Arabic) => {
                format!("أي ساعة بتناسبك يوم {}؟", say_date(date.value, lang))
            }
            (None, Some(_), Language::English) => "Which day would you like to come in?".to_string(),
            (None, Some(_), Language::Arabic) => "أي يوم بدك تجي؟".to_string(),
            (_, _, Language::English) => "What day and time would you like to come in?".to_string(),
            (_, _, Language::Arabic) => "أي يوم وأي ساعة بدك تجي؟".to_string(),
        },
        (DialogState::CollectName, Language::English) => {
            "May I have your name for the booking?".to_string()
        }
        (DialogState::CollectName, Language::Arabic) => "شو الاسم للحجز؟".to_string(),
        (DialogState::Confirm, _) => confirm_question(slots, lang),
        (DialogState::Booking, Language::English) => "One moment while I book that.".to_string(),
        (DialogState::Booking, Language::Arabic) => "لحظة عم احجزلك.".to_string(),
        (DialogState::Complete, _) => {
            let reference = say_reference(session.booking_ref().unwrap_or_default());
            match lang {
                Language::English => format!(
                    "You're all set! Your booking reference is {reference}. We'll text you a confirmation. Goodbye!"
                ),
                Language::Arabic => format!(
                    "تم الحجز! رقم الحجز {reference}. رح نبعتلك رسالة تأكيد. مع السلامة!"
                ),
            }
        }
        (DialogState::Failed, Language::English) => {
            "I'm sorry, I couldn't complete your booking. Please call back later, or ask for our staff when you do. Goodbye."
                .to_string()
        }
        (DialogState::Failed, Language::Arabic) => {
            "آسفين، ما قدرت كمّل الحجز. فيك تتصل فينا بعدين وتطلب حدا من الفريق. مع السلامة.".to_string()
        }
        (DialogState::Abandoned, Language::English) => "This call has ended. Goodbye.".to_string(),
        (DialogState::Abandoned, Language::Arabic) => "انتهت المكالمة. مع السلامة.".to_string(),
    }
}

fn prefix(session: &CallSession, cue: &Cue, shop: &ShopInfo, lang: Language) -> Option<String> {
    let state = session.state();
    match cue {
        Cue::Ask => None,
        // confirmation is re-asked verbatim
        Cue::Unclear if state == DialogState::Confirm => None,
        Cue::Unclear => Some(match (state, lang) {
            (DialogState::CollectDatetime, Language::English) => {
                "Sorry, I didn't quite get that. You can say something like tomorrow at 3 PM.".to_string()
            }
            (DialogState::CollectDatetime, Language::Arabic) => {
                "عفواً، ما فهمت عليك. فيك تقول مثلاً بكرا الساعة ٣ بعد الظهر.".to_string()
            }
            (_, Language::English) => "Sorry, I didn't quite get that.".to_string(),
            (_, Language::Arabic) => "عفواً، ما فهمت عليك.".to_string(),
        }),
        Cue::LanguageSwitched => Some(match lang {
            Language::English => "Sure, let's continue in English.".to_string(),
            Language::Arabic => "أكيد، منكمل بالعربي.".to_string(),
        }),
        Cue::Info(topic) => Some(info_answer(shop, *topic, lang)),
        Cue::Availability(day) => Some(free_line(*day, &session.alternatives, lang)),
        Cue::Conflict if session.alternatives.is_empty() => Some(match lang {
            Language::English => {
                "Sorry, that time is taken and there's nothing free around it.".to_string()
            }
            Language::Arabic => "عفواً، هيدا الوقت محجوز وما في شي فاضي قريب منه.".to_string(),
        }),
        Cue::Conflict => Some(match lang {
            Language::English => "Sorry, that time is already taken.".to_string(),
            Language::Arabic => "عفواً، هيدا الوقت محجوز.".to_string(),
        }),
        Cue::RetryLater => Some(match lang {
            Language::English => "Sorry, something went wrong on our side.".to_string(),
            Language::Arabic => "عفواً، صار في مشكلة عنا.".to_string(),
        }),
    }
}

/// The prompt for the session's current state, in the session's language.
pub fn render(session: &CallSession, cue: &Cue, shop: &ShopInfo) -> String {
    let lang = session.language;
    let question = match cue {
        // the free times were just read out
        Cue::Availability(_)
            if session.state() == DialogState::CollectDatetime && !session.alternatives.is_empty() =>
        {
            match lang {
                Language::English => "Which works for you?".to_string(),
                Language::Arabic => "شو بيناسبك؟".to_string(),
            }
        }
        _ => question(session, lang),
    };
    match prefix(session, cue, shop, lang) {
        Some(prefix) => format!("{prefix} {question}"),
        None => question,
    }
}

/// Opening line of a call, in one language. Calls are answered in both.
pub fn greeting(shop: &ShopInfo, lang: Language) -> String {
    match lang {
        Language::English => format!(
            "Welcome to {}! How can I help you today? You can speak English or Arabic.",
            shop.name
        ),
        Language::Arabic => format!("أهلا وسهلا بـ {}! فيك تحكي عربي أو إنكليزي.", shop.name),
    }
}

/// Text of the confirmation SMS. English first, then Arabic.
pub fn confirmation_sms(shop_name: &str, c: &BookingConfirmation) -> String {
    let english = format!(
        "{shop_name}: {}, your {} is booked for {} at {}. Ref {}.",
        c.customer_name,
        c.service.name(Language::English),
        say_date(c.date, Language::English),
        say_time(c.time, Language::English),
        c.booking_ref
    );
    let arabic = format!(
        "{shop_name}: {}، تم حجز {} يوم {} {}. رقم الحجز {}.",
        c.customer_name,
        c.service.name(Language::Arabic),
        say_date(c.date, Language::Arabic),
        say_time(c.time, Language::Arabic),
        c.booking_ref
    );
    format!("{english}\n{arabic}")
}
